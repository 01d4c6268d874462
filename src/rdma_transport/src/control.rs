// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! READY-gated request/response exchange over IB SEND/RECV.
//!
//! Both peers keep a RECV posted at all times, so no SEND is ever in
//! flight without a buffer waiting for it. A receiver first announces
//! READY; a sender with `control_ready_expected` set waits for that READY
//! before posting, optionally posts one extra RECV for an anticipated
//! response, then sends and, if expecting, blocks on the response. The
//! response piggybacks on the acknowledgement so registrations cost a
//! single round trip.

use log::debug;

use crate::backend::IbBackend;
use crate::error::{RdmaError, Result};
use crate::registry::Link;
use crate::wire::{ControlHeader, ControlType, CONTROL_MAX_BUFFER};
use crate::wrid::WorkRequestId;
use crate::{RdmaTransport, CTRL_DATA, CTRL_READY, CTRL_SEND};

impl<B: IbBackend> RdmaTransport<B> {
    /// Unconsumed payload of the last message landed in `slot`.
    pub(crate) fn ctrl_payload(&self, slot: usize) -> &[u8] {
        let ctrl = &self.ctrl[slot];
        let start = ControlHeader::WIRE_SIZE + ctrl.cur;
        &ctrl.buf[start..ControlHeader::WIRE_SIZE + ctrl.len]
    }

    /// Copies up to `out.len()` unconsumed payload bytes out of `slot`.
    pub(crate) fn ctrl_fill(&mut self, slot: usize, out: &mut [u8]) -> usize {
        let ctrl = &mut self.ctrl[slot];
        let avail = ctrl.len - ctrl.cur;
        let take = std::cmp::min(avail, out.len());
        let start = ControlHeader::WIRE_SIZE + ctrl.cur;
        out[..take].copy_from_slice(&ctrl.buf[start..start + take]);
        ctrl.cur += take;
        take
    }

    /// Points `slot`'s payload cursor at the freshly received message.
    fn move_header(&mut self, slot: usize, head: &ControlHeader) {
        let ctrl = &mut self.ctrl[slot];
        ctrl.len = head.len as usize;
        ctrl.cur = 0;
    }

    /// Posts a SEND carrying `head` (and `data`, when present) and blocks
    /// until the send completes.
    pub(crate) fn post_send_control(
        &mut self,
        head: ControlHeader,
        data: Option<&[u8]>,
    ) -> Result<()> {
        debug!("control: sending {}", head.kind.name());

        if head.len as usize > CONTROL_MAX_BUFFER - ControlHeader::WIRE_SIZE {
            return Err(RdmaError::ControlOverflow(head.len));
        }

        let (addr, lkey) = {
            let slot = &mut self.ctrl[CTRL_SEND];
            head.to_wire(&mut slot.buf[..ControlHeader::WIRE_SIZE]);
            if let Some(data) = data {
                debug_assert_eq!(data.len(), head.len as usize);
                slot.buf[ControlHeader::WIRE_SIZE..ControlHeader::WIRE_SIZE + data.len()]
                    .copy_from_slice(data);
            }
            (slot.addr(), slot.mr.lkey)
        };

        self.backend.post_send(
            Link::Remote,
            WorkRequestId::SEND_CONTROL,
            addr,
            (ControlHeader::WIRE_SIZE + head.len as usize) as u32,
            lkey,
        )?;

        self.block_for_wrid(Link::Remote, WorkRequestId::SEND_CONTROL.type_bits())?;
        Ok(())
    }

    /// Posts a RECV buffer on `slot` for a future control message.
    pub(crate) fn post_recv_control(&mut self, slot: usize) -> Result<()> {
        let (addr, lkey) = (self.ctrl[slot].addr(), self.ctrl[slot].mr.lkey);
        self.backend.post_recv(
            Link::Remote,
            WorkRequestId::recv_control(slot),
            addr,
            CONTROL_MAX_BUFFER as u32,
            lkey,
        )
    }

    /// Blocks until a control message lands in `slot` and validates it
    /// against `expecting` (`None` accepts any type).
    pub(crate) fn exchange_get_response(
        &mut self,
        expecting: Option<ControlType>,
        slot: usize,
    ) -> Result<ControlHeader> {
        let byte_len =
            self.block_for_wrid(Link::Remote, WorkRequestId::recv_control(slot).type_bits())?;

        let head = ControlHeader::from_wire(&self.ctrl[slot].buf[..ControlHeader::WIRE_SIZE])?;
        debug!("control: received {}", head.kind.name());

        match expecting {
            None => {}
            Some(expected) => {
                if head.kind == ControlType::Error {
                    return Err(RdmaError::Protocol("peer signaled an error"));
                }
                if head.kind != expected {
                    return Err(RdmaError::UnexpectedMessage(
                        expected.name(),
                        head.kind.name(),
                    ));
                }
            }
        }

        if head.len as usize > CONTROL_MAX_BUFFER - ControlHeader::WIRE_SIZE {
            return Err(RdmaError::ControlOverflow(head.len));
        }
        if ControlHeader::WIRE_SIZE as u32 + head.len != byte_len {
            return Err(RdmaError::MalformedLength(head.len));
        }

        Ok(head)
    }

    /// Delivers one control message, honoring the READY discipline.
    ///
    /// When `resp` is set, an extra RECV is posted for the anticipated
    /// response and the call blocks until it arrives; the response
    /// payload is then readable via the data slot. `resp_hook` runs
    /// between the send and the response wait, so slow local work (such
    /// as whole-RAM pinning) overlaps the peer's side of the exchange.
    pub(crate) fn exchange_send(
        &mut self,
        head: ControlHeader,
        data: Option<&[u8]>,
        resp: Option<ControlType>,
        resp_hook: Option<fn(&mut Self) -> Result<()>>,
    ) -> Result<Option<ControlHeader>> {
        // Wait until the peer says it is ready for us. The ready slot's
        // payload cursor is left alone; it may still hold unconsumed
        // byte-stream data.
        if self.control_ready_expected {
            self.exchange_get_response(Some(ControlType::Ready), CTRL_READY)?;
        }

        if resp.is_some() {
            self.post_recv_control(CTRL_DATA)?;
        }

        // Replace the RECV consumed by the READY message.
        self.post_recv_control(CTRL_READY)?;

        self.post_send_control(head, data)?;

        let resp_head = match resp {
            None => None,
            Some(expected) => {
                if let Some(hook) = resp_hook {
                    hook(self)?;
                }
                let resp_head = self.exchange_get_response(Some(expected), CTRL_DATA)?;
                self.move_header(CTRL_DATA, &resp_head);
                Some(resp_head)
            }
        };

        self.control_ready_expected = true;
        Ok(resp_head)
    }

    /// Receives one control message: announce READY, block for the
    /// message, re-post the consumed RECV. The payload is readable via
    /// the ready slot.
    pub(crate) fn exchange_recv(&mut self, expecting: Option<ControlType>) -> Result<ControlHeader> {
        self.post_send_control(ControlHeader::new(ControlType::Ready, 0, 1), None)?;

        let head = self.exchange_get_response(expecting, CTRL_READY)?;
        self.move_header(CTRL_READY, &head);

        self.post_recv_control(CTRL_READY)?;
        Ok(head)
    }
}
