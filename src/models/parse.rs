// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use enum_dispatch::enum_dispatch;

use crate::models::{
    async_msg::response::AsyncMessage,
    command::{request::ScsiCommandRequest, response::ScsiCommandResponse},
    common::BasicHeaderSegment,
    data::{request::ScsiDataOut, response::ScsiDataIn},
    logout::{request::LogoutRequest, response::LogoutResponse},
    nop::{request::NopOutRequest, response::NopInResponse},
    opcode::{BhsOpcode, Opcode},
    ready_2_transfer::response::ReadyToTransfer,
    reject::response::RejectPdu,
    task_mgmt::{request::TaskMgmtRequest, response::TaskMgmtResponse},
};

/// A typed view over a raw BHS, dispatched on the opcode byte. Covers
/// exactly the PDUs a target connection can see or produce.
#[enum_dispatch(BasicHeaderSegment)]
#[derive(Debug)]
pub enum Pdu<'a> {
    NopOutRequest(&'a mut NopOutRequest),
    ScsiCommandRequest(&'a mut ScsiCommandRequest),
    TaskMgmtRequest(&'a mut TaskMgmtRequest),
    ScsiDataOut(&'a mut ScsiDataOut),
    LogoutRequest(&'a mut LogoutRequest),
    NopInResponse(&'a mut NopInResponse),
    ScsiCommandResponse(&'a mut ScsiCommandResponse),
    TaskMgmtResponse(&'a mut TaskMgmtResponse),
    ScsiDataIn(&'a mut ScsiDataIn),
    LogoutResponse(&'a mut LogoutResponse),
    ReadyToTransfer(&'a mut ReadyToTransfer),
    AsyncMessage(&'a mut AsyncMessage),
    RejectPdu(&'a mut RejectPdu),
}

impl<'a> Pdu<'a> {
    pub fn from_bhs_bytes(bytes: &'a mut [u8]) -> Result<Self> {
        let bhs = BhsOpcode::try_from(bytes[0])
            .map_err(|e| anyhow::anyhow!("invalid opcode: {}", e))?;
        Ok(match bhs.opcode {
            Opcode::NopOut => Pdu::NopOutRequest(NopOutRequest::from_bhs_bytes(bytes)?),
            Opcode::NopIn => Pdu::NopInResponse(NopInResponse::from_bhs_bytes(bytes)?),
            Opcode::ScsiCommandReq => {
                Pdu::ScsiCommandRequest(ScsiCommandRequest::from_bhs_bytes(bytes)?)
            },
            Opcode::ScsiCommandResp => {
                Pdu::ScsiCommandResponse(ScsiCommandResponse::from_bhs_bytes(bytes)?)
            },
            Opcode::ScsiTaskMgmtReq => {
                Pdu::TaskMgmtRequest(TaskMgmtRequest::from_bhs_bytes(bytes)?)
            },
            Opcode::ScsiTaskMgmtResp => {
                Pdu::TaskMgmtResponse(TaskMgmtResponse::from_bhs_bytes(bytes)?)
            },
            Opcode::ScsiDataOut => Pdu::ScsiDataOut(ScsiDataOut::from_bhs_bytes(bytes)?),
            Opcode::ScsiDataIn => Pdu::ScsiDataIn(ScsiDataIn::from_bhs_bytes(bytes)?),
            Opcode::LogoutReq => Pdu::LogoutRequest(LogoutRequest::from_bhs_bytes(bytes)?),
            Opcode::LogoutResp => {
                Pdu::LogoutResponse(LogoutResponse::from_bhs_bytes(bytes)?)
            },
            Opcode::ReadyToTransfer => {
                Pdu::ReadyToTransfer(ReadyToTransfer::from_bhs_bytes(bytes)?)
            },
            Opcode::AsyncMsg => Pdu::AsyncMessage(AsyncMessage::from_bhs_bytes(bytes)?),
            Opcode::Reject => Pdu::RejectPdu(RejectPdu::from_bhs_bytes(bytes)?),
            other => bail!("unsupported opcode: {:?}", other),
        })
    }
}
