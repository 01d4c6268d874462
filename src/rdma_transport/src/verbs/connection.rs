// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Queue-pair bring-up over the RDMA connection manager.
//!
//! The source resolves the destination with `rdma_getaddrinfo`, trying
//! each returned address and skipping IPv6 on pure-RoCE systems where the
//! kernel cannot route it. Both sides exchange a capability record in the
//! connection private data. After the remote queue pair is established,
//! each side brings up a pair of loopback queue pairs (INIT → RTR → RTS
//! by hand) used for consistent local RAM copies.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::raw::{c_int, c_void};

use log::{debug, error, info, warn};

use checkpoint::hypervisor::RamBlockInfo;

use crate::backend::{Completion, IbBackend, WaitStrategy, WriteRequest};
use crate::error::{RdmaError, Result};
use crate::registry::{Link, MrHandle, MrInfo, NB_LINKS};
use crate::wire::{
    Capabilities, CAP_KEEPALIVE, CAP_PIN_ALL, CONTROL_VERSION, KNOWN_CAPABILITIES,
};
use crate::wrid::WorkRequestId;
use crate::{RdmaTransport, TransportOptions, SEND_MAX};

use super::ffi;

/// How long address and route resolution may take.
const RESOLVE_TIMEOUT_MS: c_int = 10_000;

/// Everything needed to open one replication connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Peer host (source) or bind address (destination).
    pub host: String,
    pub port: u16,
    pub options: TransportOptions,
    /// Blocking behavior of completion waits.
    pub wait: WaitStrategy,
}

/// Per-queue-pair device resources.
struct LinkState {
    verbs: *mut ffi::ibv_context,
    /// Local links open their own device context; the remote link borrows
    /// the connection manager's.
    owns_verbs: bool,
    pd: *mut ffi::ibv_pd,
    comp_channel: *mut ffi::ibv_comp_channel,
    cq: *mut ffi::ibv_cq,
    qp: *mut ffi::ibv_qp,
    /// Queue pairs created through the connection manager are destroyed
    /// with their id, not by us.
    owns_qp: bool,
    psn: u32,
    port_num: u8,
    lid: u16,
    gid: ffi::ibv_gid,
}

impl LinkState {
    fn empty() -> LinkState {
        LinkState {
            verbs: std::ptr::null_mut(),
            owns_verbs: false,
            pd: std::ptr::null_mut(),
            comp_channel: std::ptr::null_mut(),
            cq: std::ptr::null_mut(),
            qp: std::ptr::null_mut(),
            owns_qp: false,
            psn: 0,
            port_num: 1,
            lid: 0,
            gid: ffi::ibv_gid { raw: [0; 16] },
        }
    }

    /// Tears the link down in reverse allocation order.
    fn close(&mut self) {
        // SAFETY: pointers are only non-null while the resources they
        // name are alive, and are nulled as they are released.
        unsafe {
            if !self.qp.is_null() {
                let mut attr: ffi::ibv_qp_attr = std::mem::zeroed();
                attr.qp_state = ffi::IBV_QPS_ERR;
                ffi::ibv_modify_qp(self.qp, &mut attr, ffi::IBV_QP_STATE);
                if self.owns_qp {
                    ffi::ibv_destroy_qp(self.qp);
                }
                self.qp = std::ptr::null_mut();
            }
            if !self.cq.is_null() {
                ffi::ibv_destroy_cq(self.cq);
                self.cq = std::ptr::null_mut();
            }
            if !self.comp_channel.is_null() {
                ffi::ibv_destroy_comp_channel(self.comp_channel);
                self.comp_channel = std::ptr::null_mut();
            }
            if !self.pd.is_null() {
                ffi::ibv_dealloc_pd(self.pd);
                self.pd = std::ptr::null_mut();
            }
            if !self.verbs.is_null() {
                if self.owns_verbs {
                    ffi::ibv_close_device(self.verbs);
                }
                self.verbs = std::ptr::null_mut();
            }
        }
    }
}

/// The production [`IbBackend`]: real verbs queue pairs connected through
/// the RDMA connection manager.
pub struct VerbsBackend {
    wait: WaitStrategy,
    channel: *mut ffi::rdma_event_channel,
    cm_id: *mut ffi::rdma_cm_id,
    listen_id: *mut ffi::rdma_cm_id,
    connected: bool,
    links: [LinkState; NB_LINKS],
    mrs: HashMap<u64, *mut ffi::ibv_mr>,
    next_handle: u64,
    /// Completion consumed while closing the arm/wait race, returned by
    /// the next poll.
    stashed: Vec<(Link, Completion)>,
}

// SAFETY: the raw device pointers are only ever dereferenced by the
// thread that owns the backend; nothing is shared.
unsafe impl Send for VerbsBackend {}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// Pure-RoCE systems cannot route IPv6 through the kernel's RDMA stack;
/// refuse such addresses so a working one can be tried instead.
fn broken_ipv6_kernel(verbs: *mut ffi::ibv_context) -> Result<()> {
    // SAFETY: verbs either is null or points at a live device context.
    unsafe {
        if verbs.is_null() {
            // Bound to a wildcard address: scan every device.
            let mut num_devices: c_int = 0;
            let list = ffi::ibv_get_device_list(&mut num_devices);
            if list.is_null() {
                return Ok(());
            }
            let mut roce_found = false;
            let mut ib_found = false;
            for i in 0..num_devices as isize {
                let context = ffi::ibv_open_device(*list.offset(i));
                if context.is_null() {
                    continue;
                }
                let mut port: ffi::ibv_port_attr = std::mem::zeroed();
                if ffi::ibv_query_port(context, 1, &mut port) == 0 {
                    match port.link_layer {
                        ffi::IBV_LINK_LAYER_INFINIBAND => ib_found = true,
                        ffi::IBV_LINK_LAYER_ETHERNET => roce_found = true,
                        _ => {}
                    }
                }
                ffi::ibv_close_device(context);
            }
            ffi::ibv_free_device_list(list);

            if roce_found && !ib_found {
                return Err(RdmaError::Setup(
                    "only RoCE devices present and IPv6 over RoCE is not supported",
                ));
            }
            if roce_found && ib_found {
                warn!(
                    "mixed RoCE / IB environment: IPv6 over RoCE is broken, \
                     migrate over the IB fabric"
                );
            }
            return Ok(());
        }

        let mut port: ffi::ibv_port_attr = std::mem::zeroed();
        if ffi::ibv_query_port(verbs, 1, &mut port) != 0 {
            return Err(RdmaError::Setup("could not query the initial IB port"));
        }
        if port.link_layer == ffi::IBV_LINK_LAYER_ETHERNET {
            return Err(RdmaError::Setup(
                "IPv6 over RoCE / iWARP is not supported by the kernel",
            ));
        }
    }
    Ok(())
}

impl VerbsBackend {
    fn new(wait: WaitStrategy) -> VerbsBackend {
        VerbsBackend {
            wait,
            channel: std::ptr::null_mut(),
            cm_id: std::ptr::null_mut(),
            listen_id: std::ptr::null_mut(),
            connected: false,
            links: [LinkState::empty(), LinkState::empty(), LinkState::empty()],
            mrs: HashMap::new(),
            next_handle: 0,
            stashed: Vec::new(),
        }
    }

    /// Waits for the next connection-manager event, requiring `expected`.
    fn expect_cm_event(&mut self, expected: u32) -> Result<()> {
        // SAFETY: channel is live; the event is acked before returning.
        unsafe {
            let mut event: *mut ffi::rdma_cm_event = std::ptr::null_mut();
            if ffi::rdma_get_cm_event(self.channel, &mut event) != 0 {
                return Err(RdmaError::Setup("waiting for a connection event"));
            }
            let kind = (*event).event;
            ffi::rdma_ack_cm_event(event);
            if kind != expected {
                error!(
                    "unexpected connection manager event {} (wanted {})",
                    kind, expected
                );
                return Err(RdmaError::Setup("unexpected connection manager event"));
            }
        }
        Ok(())
    }

    fn alloc_pd_cq(&mut self, link: Link) -> Result<()> {
        let state = &mut self.links[link as usize];
        // SAFETY: state.verbs is a live device context at this point.
        unsafe {
            state.pd = ffi::ibv_alloc_pd(state.verbs);
            if state.pd.is_null() {
                return Err(RdmaError::Setup(
                    "allocating a protection domain; check the memlock rlimit",
                ));
            }
            state.comp_channel = ffi::ibv_create_comp_channel(state.verbs);
            if state.comp_channel.is_null() {
                return Err(RdmaError::Setup("allocating a completion channel"));
            }
            // Sized for write and control completions together.
            state.cq = ffi::ibv_create_cq(
                state.verbs,
                (SEND_MAX * 3) as c_int,
                std::ptr::null_mut(),
                state.comp_channel,
                0,
            );
            if state.cq.is_null() {
                return Err(RdmaError::Setup("allocating a completion queue"));
            }
        }
        Ok(())
    }

    fn alloc_remote_qp(&mut self) -> Result<()> {
        let state = &mut self.links[Link::Remote as usize];
        // SAFETY: cm_id, pd and cq are live.
        unsafe {
            let mut attr: ffi::ibv_qp_init_attr = std::mem::zeroed();
            attr.cap.max_send_wr = SEND_MAX as u32;
            attr.cap.max_recv_wr = 3;
            attr.cap.max_send_sge = 1;
            attr.cap.max_recv_sge = 1;
            attr.send_cq = state.cq;
            attr.recv_cq = state.cq;
            attr.qp_type = ffi::IBV_QPT_RC;
            if ffi::rdma_create_qp(self.cm_id, state.pd, &mut attr) != 0 {
                return Err(RdmaError::Setup("creating the queue pair"));
            }
            state.qp = (*self.cm_id).qp;
            state.owns_qp = false;
        }
        Ok(())
    }

    /// Resolves the destination and prepares the remote queue pair.
    pub(super) fn source_init(config: &ConnectionConfig) -> Result<VerbsBackend> {
        let mut backend = VerbsBackend::new(config.wait);
        let result = backend.source_init_inner(config);
        if result.is_err() {
            backend.teardown();
        }
        result.map(|()| backend)
    }

    fn source_init_inner(&mut self, config: &ConnectionConfig) -> Result<()> {
        if config.host.is_empty() {
            return Err(RdmaError::Setup("RDMA hostname has not been set"));
        }

        // SAFETY: the calls below use resources allocated in order and
        // checked for null before use.
        unsafe {
            self.channel = ffi::rdma_create_event_channel();
            if self.channel.is_null() {
                return Err(RdmaError::Setup("creating the connection manager channel"));
            }
            if ffi::rdma_create_id(
                self.channel,
                &mut self.cm_id,
                std::ptr::null_mut(),
                ffi::RDMA_PS_TCP,
            ) != 0
            {
                return Err(RdmaError::Setup("creating the connection manager id"));
            }

            let node = CString::new(config.host.as_str())
                .map_err(|_| RdmaError::Setup("bad RDMA hostname"))?;
            let service = CString::new(config.port.to_string())
                .map_err(|_| RdmaError::Setup("bad RDMA port"))?;
            let mut res: *mut ffi::rdma_addrinfo = std::ptr::null_mut();
            if ffi::rdma_getaddrinfo(
                node.as_ptr(),
                service.as_ptr(),
                std::ptr::null(),
                &mut res,
            ) != 0
            {
                return Err(RdmaError::Setup("could not resolve the RDMA address"));
            }

            let mut resolved = false;
            let mut entry = res;
            while !entry.is_null() {
                if ffi::rdma_resolve_addr(
                    self.cm_id,
                    std::ptr::null_mut(),
                    (*entry).ai_dst_addr,
                    RESOLVE_TIMEOUT_MS,
                ) == 0
                {
                    if (*entry).ai_family == libc::AF_INET6 {
                        if let Err(err) = broken_ipv6_kernel((*self.cm_id).verbs) {
                            warn!("skipping an IPv6 address: {}", err);
                            entry = (*entry).ai_next;
                            continue;
                        }
                    }
                    resolved = true;
                    break;
                }
                entry = (*entry).ai_next;
            }
            ffi::rdma_freeaddrinfo(res);
            if !resolved {
                return Err(RdmaError::Setup("could not resolve any RDMA address"));
            }

            self.expect_cm_event(ffi::RDMA_CM_EVENT_ADDR_RESOLVED)?;
            if ffi::rdma_resolve_route(self.cm_id, RESOLVE_TIMEOUT_MS) != 0 {
                return Err(RdmaError::Setup("could not resolve the RDMA route"));
            }
            self.expect_cm_event(ffi::RDMA_CM_EVENT_ROUTE_RESOLVED)?;

            self.links[Link::Remote as usize].verbs = (*self.cm_id).verbs;
        }

        self.alloc_pd_cq(Link::Remote)?;
        self.alloc_remote_qp()?;
        info!("resolved {}:{}", config.host, config.port);
        Ok(())
    }

    /// Binds and listens for the source's connection.
    pub(super) fn dest_init(config: &ConnectionConfig) -> Result<VerbsBackend> {
        let mut backend = VerbsBackend::new(config.wait);
        let result = backend.dest_init_inner(config);
        if result.is_err() {
            backend.teardown();
        }
        result.map(|()| backend)
    }

    fn dest_init_inner(&mut self, config: &ConnectionConfig) -> Result<()> {
        if config.host.is_empty() {
            return Err(RdmaError::Setup("migration host and port not specified"));
        }

        // SAFETY: as in source_init_inner.
        unsafe {
            self.channel = ffi::rdma_create_event_channel();
            if self.channel.is_null() {
                return Err(RdmaError::Setup("creating the connection manager channel"));
            }
            if ffi::rdma_create_id(
                self.channel,
                &mut self.listen_id,
                std::ptr::null_mut(),
                ffi::RDMA_PS_TCP,
            ) != 0
            {
                return Err(RdmaError::Setup("creating the listen id"));
            }

            let node = CString::new(config.host.as_str())
                .map_err(|_| RdmaError::Setup("bad RDMA hostname"))?;
            let service = CString::new(config.port.to_string())
                .map_err(|_| RdmaError::Setup("bad RDMA port"))?;
            let mut res: *mut ffi::rdma_addrinfo = std::ptr::null_mut();
            if ffi::rdma_getaddrinfo(
                node.as_ptr(),
                service.as_ptr(),
                std::ptr::null(),
                &mut res,
            ) != 0
            {
                return Err(RdmaError::Setup("could not resolve the bind address"));
            }

            let mut bound = false;
            let mut entry = res;
            while !entry.is_null() {
                if ffi::rdma_bind_addr(self.listen_id, (*entry).ai_dst_addr) == 0 {
                    if (*entry).ai_family == libc::AF_INET6 {
                        if let Err(err) = broken_ipv6_kernel((*self.listen_id).verbs) {
                            warn!("skipping an IPv6 bind address: {}", err);
                            entry = (*entry).ai_next;
                            continue;
                        }
                    }
                    bound = true;
                    break;
                }
                entry = (*entry).ai_next;
            }
            ffi::rdma_freeaddrinfo(res);
            if !bound {
                return Err(RdmaError::Setup("could not bind the RDMA address"));
            }

            if ffi::rdma_listen(self.listen_id, 5) != 0 {
                return Err(RdmaError::Setup("listening on the RDMA address"));
            }
        }
        info!("listening on {}:{}", config.host, config.port);
        Ok(())
    }

    /// Blocks for the source's connection request, sets up the remote
    /// queue pair and returns the capabilities the source asked for.
    pub(super) fn wait_connect_request(&mut self) -> Result<Capabilities> {
        // SAFETY: the event is fully read before being acked.
        let requested = unsafe {
            let mut event: *mut ffi::rdma_cm_event = std::ptr::null_mut();
            if ffi::rdma_get_cm_event(self.channel, &mut event) != 0 {
                return Err(RdmaError::Setup("waiting for a connection request"));
            }
            if (*event).event != ffi::RDMA_CM_EVENT_CONNECT_REQUEST {
                ffi::rdma_ack_cm_event(event);
                return Err(RdmaError::Setup("expected a connection request"));
            }

            let private = (*event).param.conn.private_data;
            if private.is_null()
                || ((*event).param.conn.private_data_len as usize) < Capabilities::WIRE_SIZE
            {
                ffi::rdma_ack_cm_event(event);
                return Err(RdmaError::Setup("connection request without capabilities"));
            }
            let raw =
                std::slice::from_raw_parts(private as *const u8, Capabilities::WIRE_SIZE);
            let requested = Capabilities::from_wire(raw);

            self.cm_id = (*event).id;
            self.links[Link::Remote as usize].verbs = (*(*event).id).verbs;
            ffi::rdma_ack_cm_event(event);
            requested
        };

        if requested.version < 1 || requested.version > CONTROL_VERSION {
            return Err(RdmaError::Setup("unknown peer protocol version"));
        }

        self.alloc_pd_cq(Link::Remote)?;
        self.alloc_remote_qp()?;
        debug!(
            "connection requested with capability flags {:#x}",
            requested.flags
        );
        Ok(requested)
    }

    /// Connects to the destination, carrying `local` in the private data.
    /// Returns the destination's capability reply.
    pub(super) fn connect(&mut self, local: &Capabilities) -> Result<Capabilities> {
        let mut raw = [0u8; Capabilities::WIRE_SIZE];
        local.to_wire(&mut raw);

        // SAFETY: the private-data buffer outlives rdma_connect, and the
        // reply event is fully read before being acked.
        unsafe {
            let mut param = ffi::rdma_conn_param {
                initiator_depth: 2,
                retry_count: 5,
                private_data: raw.as_ptr() as *const c_void,
                private_data_len: raw.len() as u8,
                ..Default::default()
            };
            if ffi::rdma_connect(self.cm_id, &mut param) != 0 {
                return Err(RdmaError::Setup("connecting to the destination"));
            }

            let mut event: *mut ffi::rdma_cm_event = std::ptr::null_mut();
            if ffi::rdma_get_cm_event(self.channel, &mut event) != 0 {
                return Err(RdmaError::Setup("waiting for connection establishment"));
            }
            if (*event).event != ffi::RDMA_CM_EVENT_ESTABLISHED {
                ffi::rdma_ack_cm_event(event);
                return Err(RdmaError::Setup("connection was not established"));
            }

            let private = (*event).param.conn.private_data;
            if private.is_null()
                || ((*event).param.conn.private_data_len as usize) < Capabilities::WIRE_SIZE
            {
                ffi::rdma_ack_cm_event(event);
                return Err(RdmaError::Setup("peer sent no capability reply"));
            }
            let reply = Capabilities::from_wire(std::slice::from_raw_parts(
                private as *const u8,
                Capabilities::WIRE_SIZE,
            ));
            ffi::rdma_ack_cm_event(event);

            self.connected = true;
            Ok(reply)
        }
    }

    /// Accepts the pending request, carrying `reply` in the private data.
    pub(super) fn accept(&mut self, reply: &Capabilities) -> Result<()> {
        let mut raw = [0u8; Capabilities::WIRE_SIZE];
        reply.to_wire(&mut raw);

        // SAFETY: as in connect.
        unsafe {
            let mut param = ffi::rdma_conn_param {
                responder_resources: 2,
                private_data: raw.as_ptr() as *const c_void,
                private_data_len: raw.len() as u8,
                ..Default::default()
            };
            if ffi::rdma_accept(self.cm_id, &mut param) != 0 {
                return Err(RdmaError::Setup("accepting the connection"));
            }
        }
        self.expect_cm_event(ffi::RDMA_CM_EVENT_ESTABLISHED)?;
        self.connected = true;
        Ok(())
    }

    /// Opens one loopback queue pair on the same device as the remote
    /// link and readies it for manual connection.
    fn open_local(&mut self, link: Link) -> Result<()> {
        let remote_qp = self.links[Link::Remote as usize].qp;
        let remote_verbs = self.links[Link::Remote as usize].verbs;

        // SAFETY: the remote link is fully established before local
        // links are opened.
        unsafe {
            let mut query: ffi::ibv_qp_attr = std::mem::zeroed();
            let mut query_init: ffi::ibv_qp_init_attr = std::mem::zeroed();
            if ffi::ibv_query_qp(remote_qp, &mut query, ffi::IBV_QP_PORT, &mut query_init) != 0 {
                return Err(RdmaError::Setup("querying the remote queue pair"));
            }
            let port_num = query.port_num;

            let verbs = ffi::ibv_open_device((*remote_verbs).device);
            if verbs.is_null() {
                return Err(RdmaError::Setup("opening the device for a local link"));
            }
            {
                let state = &mut self.links[link as usize];
                state.verbs = verbs;
                state.owns_verbs = true;
                state.port_num = port_num;
                state.psn = (libc::lrand48() & 0xFF_FFFF) as u32;
            }

            self.alloc_pd_cq(link)?;

            let state = &mut self.links[link as usize];
            let mut attr: ffi::ibv_qp_init_attr = std::mem::zeroed();
            attr.cap.max_send_wr = SEND_MAX as u32;
            attr.cap.max_recv_wr = 3;
            attr.cap.max_send_sge = 1;
            attr.cap.max_recv_sge = 1;
            attr.send_cq = state.cq;
            attr.recv_cq = state.cq;
            attr.qp_type = ffi::IBV_QPT_RC;
            state.qp = ffi::ibv_create_qp(state.pd, &mut attr);
            if state.qp.is_null() {
                return Err(RdmaError::Setup("creating a local queue pair"));
            }
            state.owns_qp = true;

            let mut init: ffi::ibv_qp_attr = std::mem::zeroed();
            init.qp_state = ffi::IBV_QPS_INIT;
            init.pkey_index = 0;
            init.port_num = port_num;
            init.qp_access_flags = ffi::IBV_ACCESS_LOCAL_WRITE
                | ffi::IBV_ACCESS_REMOTE_WRITE
                | ffi::IBV_ACCESS_REMOTE_READ;
            if ffi::ibv_modify_qp(
                state.qp,
                &mut init,
                ffi::IBV_QP_STATE
                    | ffi::IBV_QP_PKEY_INDEX
                    | ffi::IBV_QP_PORT
                    | ffi::IBV_QP_ACCESS_FLAGS,
            ) != 0
            {
                return Err(RdmaError::Setup("moving a local queue pair to INIT"));
            }

            let mut port: ffi::ibv_port_attr = std::mem::zeroed();
            if ffi::ibv_query_port(state.verbs, port_num, &mut port) != 0 {
                return Err(RdmaError::Setup("querying local port attributes"));
            }
            state.lid = port.lid;
            if ffi::ibv_query_gid(state.verbs, 1, 0, &mut state.gid) != 0 {
                return Err(RdmaError::Setup("querying the local gid"));
            }
        }
        Ok(())
    }

    /// Moves `dest`'s queue pair to RTR against `src`, then to RTS.
    fn connect_local(&mut self, src: Link, dest: Link) -> Result<()> {
        let (src_qp_num, src_psn, src_lid, src_gid, src_port) = {
            let state = &self.links[src as usize];
            // SAFETY: the queue pair was created by open_local.
            let qp_num = unsafe { (*state.qp).qp_num };
            (qp_num, state.psn, state.lid, state.gid, state.port_num)
        };
        let dest_state = &self.links[dest as usize];

        // SAFETY: both queue pairs are live and in INIT.
        unsafe {
            let mut next: ffi::ibv_qp_attr = std::mem::zeroed();
            next.qp_state = ffi::IBV_QPS_RTR;
            next.path_mtu = ffi::IBV_MTU_1024;
            next.dest_qp_num = src_qp_num;
            next.rq_psn = src_psn;
            next.max_dest_rd_atomic = 1;
            next.min_rnr_timer = 12;
            next.ah_attr.is_global = 0;
            next.ah_attr.dlid = src_lid;
            next.ah_attr.sl = 0;
            next.ah_attr.src_path_bits = 0;
            next.ah_attr.port_num = src_port;
            if src_gid.interface_id() != 0 {
                next.ah_attr.is_global = 1;
                next.ah_attr.grh.hop_limit = 1;
                next.ah_attr.grh.dgid = src_gid;
                next.ah_attr.grh.sgid_index = 0;
            }
            if ffi::ibv_modify_qp(
                dest_state.qp,
                &mut next,
                ffi::IBV_QP_STATE
                    | ffi::IBV_QP_AV
                    | ffi::IBV_QP_PATH_MTU
                    | ffi::IBV_QP_DEST_QPN
                    | ffi::IBV_QP_RQ_PSN
                    | ffi::IBV_QP_MAX_DEST_RD_ATOMIC
                    | ffi::IBV_QP_MIN_RNR_TIMER,
            ) != 0
            {
                return Err(RdmaError::Setup("moving a local queue pair to RTR"));
            }

            next.qp_state = ffi::IBV_QPS_RTS;
            next.timeout = 14;
            next.retry_cnt = 7;
            next.rnr_retry = 7;
            next.sq_psn = dest_state.psn;
            next.max_rd_atomic = 1;
            if ffi::ibv_modify_qp(
                dest_state.qp,
                &mut next,
                ffi::IBV_QP_STATE
                    | ffi::IBV_QP_TIMEOUT
                    | ffi::IBV_QP_RETRY_CNT
                    | ffi::IBV_QP_RNR_RETRY
                    | ffi::IBV_QP_SQ_PSN
                    | ffi::IBV_QP_MAX_QP_RD_ATOMIC,
            ) != 0
            {
                return Err(RdmaError::Setup("moving a local queue pair to RTS"));
            }
        }
        Ok(())
    }

    /// Brings up and cross-connects the local-copy queue pairs.
    pub(super) fn init_local_qps(&mut self) -> Result<()> {
        debug!("opening local copy queue pairs");
        self.open_local(Link::LocalSrc)?;
        self.open_local(Link::LocalDest)?;
        self.connect_local(Link::LocalSrc, Link::LocalDest)?;
        self.connect_local(Link::LocalDest, Link::LocalSrc)?;
        Ok(())
    }

    /// Orderly disconnect followed by resource teardown.
    pub fn teardown(&mut self) {
        // SAFETY: resources are released exactly once, in reverse
        // allocation order, and nulled as they go.
        unsafe {
            if self.connected && !self.cm_id.is_null() {
                ffi::rdma_disconnect(self.cm_id);
                let mut event: *mut ffi::rdma_cm_event = std::ptr::null_mut();
                if ffi::rdma_get_cm_event(self.channel, &mut event) == 0 {
                    ffi::rdma_ack_cm_event(event);
                }
                self.connected = false;
            }

            for (_, mr) in self.mrs.drain() {
                ffi::ibv_dereg_mr(mr);
            }

            for state in self.links.iter_mut() {
                state.close();
            }

            if !self.listen_id.is_null() {
                ffi::rdma_destroy_id(self.listen_id);
                self.listen_id = std::ptr::null_mut();
            }
            if !self.cm_id.is_null() {
                ffi::rdma_destroy_id(self.cm_id);
                self.cm_id = std::ptr::null_mut();
            }
            if !self.channel.is_null() {
                ffi::rdma_destroy_event_channel(self.channel);
                self.channel = std::ptr::null_mut();
            }
        }
    }
}

impl Drop for VerbsBackend {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl IbBackend for VerbsBackend {
    fn register(
        &mut self,
        link: Link,
        addr: u64,
        len: u64,
        remote_access: bool,
    ) -> Result<MrInfo> {
        let pd = self.links[link as usize].pd;
        if pd.is_null() {
            return Err(RdmaError::Setup("registering before the link is up"));
        }
        let access = if remote_access {
            (ffi::IBV_ACCESS_LOCAL_WRITE | ffi::IBV_ACCESS_REMOTE_WRITE) as c_int
        } else {
            0
        };
        // SAFETY: callers register either buffers they own or guest RAM
        // enumerated by the hypervisor.
        let mr = unsafe { ffi::ibv_reg_mr(pd, addr as *mut c_void, len as usize, access) };
        if mr.is_null() {
            error!("failed to register {} bytes at {:#x}", len, addr);
            return Err(RdmaError::RegisterFailure);
        }
        self.next_handle += 1;
        let handle = self.next_handle;
        self.mrs.insert(handle, mr);
        // SAFETY: mr was just checked non-null.
        let (lkey, rkey) = unsafe { ((*mr).lkey, (*mr).rkey) };
        Ok(MrInfo {
            handle: MrHandle(handle),
            lkey,
            rkey,
        })
    }

    fn deregister(&mut self, _link: Link, handle: MrHandle) -> Result<()> {
        let mr = self
            .mrs
            .remove(&handle.0)
            .ok_or(RdmaError::DeregisterFailure(libc::EINVAL))?;
        // SAFETY: the handle map guarantees the registration is live.
        let ret = unsafe { ffi::ibv_dereg_mr(mr) };
        if ret != 0 {
            return Err(RdmaError::DeregisterFailure(ret));
        }
        Ok(())
    }

    fn post_write(&mut self, link: Link, request: WriteRequest) -> Result<()> {
        let qp = self.links[link as usize].qp;
        let mut sge = ffi::ibv_sge {
            addr: request.local_addr,
            length: request.len,
            lkey: request.lkey,
        };
        // SAFETY: the wr references sge, which outlives the post call;
        // verbs copies the request before returning.
        unsafe {
            let mut wr: ffi::ibv_send_wr = std::mem::zeroed();
            wr.wr_id = request.wr_id.0;
            wr.opcode = ffi::IBV_WR_RDMA_WRITE;
            wr.send_flags = if request.signaled {
                ffi::IBV_SEND_SIGNALED
            } else {
                0
            };
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.wr.rdma.remote_addr = request.remote_addr;
            wr.wr.rdma.rkey = request.rkey;

            let mut bad: *mut ffi::ibv_send_wr = std::ptr::null_mut();
            // Post errors come back positive, per the verbs convention.
            match ffi::ibv_post_send(qp, &mut wr, &mut bad) {
                0 => Ok(()),
                libc::ENOMEM => Err(RdmaError::SendQueueFull),
                err => Err(RdmaError::PostFailure(err)),
            }
        }
    }

    fn post_send(
        &mut self,
        link: Link,
        wr_id: WorkRequestId,
        addr: u64,
        len: u32,
        lkey: u32,
    ) -> Result<()> {
        let qp = self.links[link as usize].qp;
        let mut sge = ffi::ibv_sge {
            addr,
            length: len,
            lkey,
        };
        // SAFETY: as in post_write.
        unsafe {
            let mut wr: ffi::ibv_send_wr = std::mem::zeroed();
            wr.wr_id = wr_id.0;
            wr.opcode = ffi::IBV_WR_SEND;
            wr.send_flags = ffi::IBV_SEND_SIGNALED;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;

            let mut bad: *mut ffi::ibv_send_wr = std::ptr::null_mut();
            match ffi::ibv_post_send(qp, &mut wr, &mut bad) {
                0 => Ok(()),
                libc::ENOMEM => Err(RdmaError::SendQueueFull),
                err => Err(RdmaError::PostFailure(err)),
            }
        }
    }

    fn post_recv(
        &mut self,
        link: Link,
        wr_id: WorkRequestId,
        addr: u64,
        len: u32,
        lkey: u32,
    ) -> Result<()> {
        let qp = self.links[link as usize].qp;
        let mut sge = ffi::ibv_sge {
            addr,
            length: len,
            lkey,
        };
        // SAFETY: as in post_write.
        unsafe {
            let mut wr: ffi::ibv_recv_wr = std::mem::zeroed();
            wr.wr_id = wr_id.0;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;

            let mut bad: *mut ffi::ibv_recv_wr = std::ptr::null_mut();
            match ffi::ibv_post_recv(qp, &mut wr, &mut bad) {
                0 => Ok(()),
                err => Err(RdmaError::PostFailure(err)),
            }
        }
    }

    fn poll(&mut self, link: Link) -> Result<Option<Completion>> {
        if let Some(index) = self.stashed.iter().position(|(l, _)| *l == link) {
            return Ok(Some(self.stashed.remove(index).1));
        }

        let cq = self.links[link as usize].cq;
        // SAFETY: the cq is live for the lifetime of the link.
        unsafe {
            let mut wc: ffi::ibv_wc = std::mem::zeroed();
            match ffi::ibv_poll_cq(cq, 1, &mut wc) {
                0 => Ok(None),
                n if n < 0 => {
                    error!("polling the completion queue failed: {}", n);
                    Err(RdmaError::Verbs(last_errno()))
                }
                _ => Ok(Some(Completion {
                    wr_id: WorkRequestId(wc.wr_id),
                    status: wc.status,
                    byte_len: wc.byte_len,
                })),
            }
        }
    }

    fn wait_completion(&mut self, link: Link) -> Result<()> {
        let state = &self.links[link as usize];
        let (cq, comp_channel) = (state.cq, state.comp_channel);

        // SAFETY: cq and channel are live; events are acked as consumed.
        unsafe {
            if ffi::ibv_req_notify_cq(cq, 0) != 0 {
                return Err(RdmaError::Verbs(last_errno()));
            }

            // A completion may have slipped in between the caller's last
            // poll and the arming above; it would never raise an event.
            let mut wc: ffi::ibv_wc = std::mem::zeroed();
            let polled = ffi::ibv_poll_cq(cq, 1, &mut wc);
            if polled < 0 {
                return Err(RdmaError::Verbs(last_errno()));
            }
            if polled > 0 {
                self.stashed.push((
                    link,
                    Completion {
                        wr_id: WorkRequestId(wc.wr_id),
                        status: wc.status,
                        byte_len: wc.byte_len,
                    },
                ));
                return Ok(());
            }

            if self.wait == WaitStrategy::PollFdReadable {
                let mut pollfd = libc::pollfd {
                    fd: (*comp_channel).fd,
                    events: libc::POLLIN,
                    revents: 0,
                };
                loop {
                    let ret = libc::poll(&mut pollfd, 1, -1);
                    if ret > 0 {
                        break;
                    }
                    if ret < 0 && last_errno() != libc::EINTR {
                        return Err(RdmaError::Verbs(last_errno()));
                    }
                }
            }

            let mut event_cq: *mut ffi::ibv_cq = std::ptr::null_mut();
            let mut event_context: *mut c_void = std::ptr::null_mut();
            if ffi::ibv_get_cq_event(comp_channel, &mut event_cq, &mut event_context) != 0 {
                return Err(RdmaError::Verbs(last_errno()));
            }
            ffi::ibv_ack_cq_events(event_cq, 1);
        }
        Ok(())
    }

    fn set_qp_error(&mut self, link: Link) -> Result<()> {
        let qp = self.links[link as usize].qp;
        if qp.is_null() {
            return Ok(());
        }
        // SAFETY: the queue pair is live.
        unsafe {
            let mut attr: ffi::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ffi::IBV_QPS_ERR;
            if ffi::ibv_modify_qp(qp, &mut attr, ffi::IBV_QP_STATE) != 0 {
                return Err(RdmaError::Verbs(last_errno()));
            }
        }
        Ok(())
    }
}

/// Resolves and connects to the destination, negotiates capabilities and
/// returns a ready-to-use transport.
pub fn connect_source(
    config: &ConnectionConfig,
    ram_blocks: &[RamBlockInfo],
) -> Result<RdmaTransport<VerbsBackend>> {
    let backend = VerbsBackend::source_init(config)?;
    let mut transport = RdmaTransport::new(backend, true, config.options)?;
    transport.seed_ram_blocks(ram_blocks)?;

    let mut local = transport.local_keepalive_slot();
    if config.options.pin_all {
        local.flags |= CAP_PIN_ALL;
    }
    if config.options.keepalive {
        local.flags |= CAP_KEEPALIVE;
    }

    let reply = transport.backend_mut().connect(&local)?;
    transport.set_negotiated(
        config.options.pin_all && reply.flags & CAP_PIN_ALL != 0,
        config.options.keepalive && reply.flags & CAP_KEEPALIVE != 0,
    );
    transport.set_peer_keepalive(reply.keepalive_rkey, reply.keepalive_addr);

    transport.backend_mut().init_local_qps()?;
    transport.establish()?;
    info!(
        "connected: pin-all {}, keepalive {}",
        transport.pin_all(),
        transport.keepalive_enabled()
    );
    Ok(transport)
}

/// Listens for and accepts the source's connection, granting the
/// intersection of the requested and locally known capabilities.
pub fn accept_destination(
    config: &ConnectionConfig,
    ram_blocks: &[RamBlockInfo],
) -> Result<RdmaTransport<VerbsBackend>> {
    let mut backend = VerbsBackend::dest_init(config)?;
    let requested = backend.wait_connect_request()?;

    let mut transport = RdmaTransport::new(backend, false, config.options)?;
    transport.seed_ram_blocks(ram_blocks)?;

    let granted = requested.flags & KNOWN_CAPABILITIES;
    transport.set_negotiated(granted & CAP_PIN_ALL != 0, granted & CAP_KEEPALIVE != 0);
    transport.set_peer_keepalive(requested.keepalive_rkey, requested.keepalive_addr);

    let mut reply = transport.local_keepalive_slot();
    reply.flags = granted;
    transport.backend_mut().accept(&reply)?;

    transport.backend_mut().init_local_qps()?;
    transport.establish()?;
    info!(
        "accepted: pin-all {}, keepalive {}",
        transport.pin_all(),
        transport.keepalive_enabled()
    );
    Ok(transport)
}
