//! CM identifiers: listeners and connected endpoints.

use std::net::SocketAddrV4;
use std::{io, mem, ptr, ptr::NonNull};

use crate::device::{self, DeviceAttr};
use crate::event::EventChannel;
use crate::mr::{AccessFlags, MemoryRegion};
use crate::types::{ConnParams, QpCaps, Sge, WorkCompletion};

/// Maximum scatter entries per receive work request.
pub const MAX_RECV_SGE: usize = 2;

/// A connection-management id. Owns the QP created on it (if any) and the id
/// itself; both are destroyed on drop, QP first.
pub struct CmId {
    id: NonNull<rdmacm_sys::rdma_cm_id>,
    qp_created: bool,
}

impl CmId {
    /// Create a connection-oriented (TCP port space) id on `channel`.
    pub fn create(channel: &EventChannel) -> io::Result<Self> {
        unsafe {
            let mut id = ptr::null_mut();
            let rc = rdmacm_sys::rdma_create_id(
                channel.as_ptr(),
                &mut id,
                ptr::null_mut(),
                rdmacm_sys::RDMA_PS_TCP,
            );
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                id: NonNull::new_unchecked(id),
                qp_created: false,
            })
        }
    }

    /// Take ownership of an id handed over by a CONNECT_REQUEST event.
    ///
    /// # Safety
    /// `id` must be a live id whose ownership is being transferred; nothing
    /// else may destroy it afterwards.
    pub unsafe fn from_raw(id: *mut rdmacm_sys::rdma_cm_id) -> io::Result<Self> {
        NonNull::new(id)
            .map(|id| Self {
                id,
                qp_created: false,
            })
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "null cm_id"))
    }

    pub fn bind_addr(&self, addr: SocketAddrV4) -> io::Result<()> {
        let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = addr.port().to_be();
        sin.sin_addr.s_addr = u32::from(*addr.ip()).to_be();

        let rc = unsafe {
            rdmacm_sys::rdma_bind_addr(
                self.id.as_ptr(),
                &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        let rc = unsafe { rdmacm_sys::rdma_listen(self.id.as_ptr(), backlog) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accept a pending connection request with the given parameters and
    /// private data payload.
    pub fn accept(&self, params: &ConnParams, private_data: &[u8]) -> io::Result<()> {
        let mut raw = rdmacm_sys::rdma_conn_param {
            private_data: private_data.as_ptr() as *const libc::c_void,
            private_data_len: private_data.len() as u8,
            responder_resources: params.responder_resources,
            initiator_depth: params.initiator_depth,
            flow_control: params.flow_control,
            retry_count: params.retry_count,
            rnr_retry_count: params.rnr_retry_count,
            srq: params.srq,
            qp_num: params.qp_num,
        };
        let rc = unsafe { rdmacm_sys::rdma_accept(self.id.as_ptr(), &mut raw) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Reject a pending connection request, carrying `private_data` back to
    /// the initiator.
    pub fn reject(&self, private_data: &[u8]) -> io::Result<()> {
        let rc = unsafe {
            rdmacm_sys::rdma_reject(
                self.id.as_ptr(),
                private_data.as_ptr() as *const libc::c_void,
                private_data.len() as u8,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Create a Reliable Connection QP on this id. CQs and their completion
    /// channels are created implicitly by librdmacm.
    pub fn create_qp(&mut self, caps: QpCaps) -> io::Result<()> {
        let mut attr: rdmacm_sys::ibv_qp_init_attr = unsafe { mem::zeroed() };
        attr.qp_type = rdmacm_sys::IBV_QPT_RC;
        attr.cap.max_send_wr = caps.max_send_wr;
        attr.cap.max_recv_wr = caps.max_recv_wr;
        attr.cap.max_send_sge = caps.max_send_sge;
        attr.cap.max_recv_sge = caps.max_recv_sge;

        let rc =
            unsafe { rdmacm_sys::rdma_create_qp(self.id.as_ptr(), ptr::null_mut(), &mut attr) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        self.qp_created = true;
        Ok(())
    }

    /// Switch both completion channels to non-blocking.
    pub fn set_cq_channels_nonblocking(&self) -> io::Result<()> {
        unsafe {
            for chan in [
                (*self.id.as_ptr()).send_cq_channel,
                (*self.id.as_ptr()).recv_cq_channel,
            ] {
                if chan.is_null() {
                    continue;
                }
                let rc = libc::fcntl((*chan).fd, libc::F_SETFL, libc::O_NONBLOCK);
                if rc < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        Ok(())
    }

    /// Register `len` bytes at `addr` on this id's protection domain with
    /// the given access rights.
    ///
    /// # Safety
    /// The buffer must stay alive (and pinned) for the registration's
    /// lifetime.
    pub unsafe fn reg_mr(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion> {
        let pd = (*self.id.as_ptr()).pd;
        if pd.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "cm_id has no protection domain",
            ));
        }
        let mr = rdmacm_sys::ibv_reg_mr(pd, addr as *mut libc::c_void, len, access.bits());
        NonNull::new(mr)
            .map(|mr| MemoryRegion::from_raw(mr))
            .ok_or_else(io::Error::last_os_error)
    }

    /// Register a send/recv buffer with local write access.
    ///
    /// # Safety
    /// See [`CmId::reg_mr`].
    pub unsafe fn reg_msgs(&self, addr: *mut u8, len: usize) -> io::Result<MemoryRegion> {
        self.reg_mr(addr, len, AccessFlags::LOCAL_WRITE)
    }

    pub fn query_device(&self) -> io::Result<DeviceAttr> {
        let verbs = unsafe { (*self.id.as_ptr()).verbs };
        if verbs.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "cm_id has no verbs context",
            ));
        }
        unsafe { device::query_device_raw(verbs) }
    }

    pub fn has_verbs(&self) -> bool {
        unsafe { !(*self.id.as_ptr()).verbs.is_null() }
    }

    /// Opaque per-id context cookie (used as a weak back-reference).
    pub fn set_context(&self, value: u64) {
        unsafe {
            (*self.id.as_ptr()).context = value as usize as *mut libc::c_void;
        }
    }

    pub fn context(&self) -> u64 {
        unsafe { (*self.id.as_ptr()).context as usize as u64 }
    }

    pub fn qp_num(&self) -> u32 {
        unsafe {
            let qp = (*self.id.as_ptr()).qp;
            if qp.is_null() {
                0
            } else {
                (*qp).qp_num
            }
        }
    }

    fn qp(&self) -> io::Result<*mut rdmacm_sys::ibv_qp> {
        let qp = unsafe { (*self.id.as_ptr()).qp };
        if qp.is_null() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no QP on cm_id"));
        }
        Ok(qp)
    }

    /// Post a receive work request scattering into up to two entries.
    pub fn post_recv(&self, wr_id: u64, sg_list: &[Sge]) -> io::Result<()> {
        debug_assert!(!sg_list.is_empty() && sg_list.len() <= MAX_RECV_SGE);
        let qp = self.qp()?;

        let mut sges = [rdmacm_sys::ibv_sge {
            addr: 0,
            length: 0,
            lkey: 0,
        }; MAX_RECV_SGE];
        for (dst, src) in sges.iter_mut().zip(sg_list) {
            dst.addr = src.addr;
            dst.length = src.length;
            dst.lkey = src.lkey;
        }

        let mut wr: rdmacm_sys::ibv_recv_wr = unsafe { mem::zeroed() };
        wr.wr_id = wr_id;
        wr.sg_list = sges.as_mut_ptr();
        wr.num_sge = sg_list.len() as i32;

        let mut bad_wr = ptr::null_mut();
        let rc = unsafe { rdmacm_sys::ibv_post_recv(qp, &mut wr, &mut bad_wr) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }

    /// Post a signaled two-sided SEND of a single scatter entry.
    pub fn post_send(&self, wr_id: u64, sge: Sge) -> io::Result<()> {
        self.post_one_sided(wr_id, sge, rdmacm_sys::IBV_WR_SEND, 0, 0)
    }

    /// Post a signaled RDMA READ from remote `(remote_addr, rkey)` into the
    /// local scatter entry.
    pub fn post_rdma_read(
        &self,
        wr_id: u64,
        sge: Sge,
        remote_addr: u64,
        rkey: u32,
    ) -> io::Result<()> {
        self.post_one_sided(wr_id, sge, rdmacm_sys::IBV_WR_RDMA_READ, remote_addr, rkey)
    }

    /// Post a signaled RDMA WRITE of the local scatter entry to remote
    /// `(remote_addr, rkey)`.
    pub fn post_rdma_write(
        &self,
        wr_id: u64,
        sge: Sge,
        remote_addr: u64,
        rkey: u32,
    ) -> io::Result<()> {
        self.post_one_sided(wr_id, sge, rdmacm_sys::IBV_WR_RDMA_WRITE, remote_addr, rkey)
    }

    fn post_one_sided(
        &self,
        wr_id: u64,
        sge: Sge,
        opcode: u32,
        remote_addr: u64,
        rkey: u32,
    ) -> io::Result<()> {
        let qp = self.qp()?;

        let mut raw_sge = rdmacm_sys::ibv_sge {
            addr: sge.addr,
            length: sge.length,
            lkey: sge.lkey,
        };

        let mut wr: rdmacm_sys::ibv_send_wr = unsafe { mem::zeroed() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut raw_sge;
        wr.num_sge = 1;
        wr.opcode = opcode;
        wr.send_flags = rdmacm_sys::IBV_SEND_SIGNALED;
        if opcode != rdmacm_sys::IBV_WR_SEND {
            wr.wr.rdma.remote_addr = remote_addr;
            wr.wr.rdma.rkey = rkey;
        }

        let mut bad_wr = ptr::null_mut();
        let rc = unsafe { rdmacm_sys::ibv_post_send(qp, &mut wr, &mut bad_wr) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }

    /// Poll one completion off the send CQ. `None` means the queue is empty.
    pub fn poll_send_cq(&self) -> io::Result<Option<WorkCompletion>> {
        unsafe { self.poll_cq((*self.id.as_ptr()).send_cq) }
    }

    /// Poll one completion off the recv CQ. `None` means the queue is empty.
    pub fn poll_recv_cq(&self) -> io::Result<Option<WorkCompletion>> {
        unsafe { self.poll_cq((*self.id.as_ptr()).recv_cq) }
    }

    fn poll_cq(&self, cq: *mut rdmacm_sys::ibv_cq) -> io::Result<Option<WorkCompletion>> {
        if cq.is_null() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no CQ on cm_id"));
        }
        unsafe {
            let mut wc = mem::zeroed::<rdmacm_sys::ibv_wc>();
            let rc = rdmacm_sys::ibv_poll_cq(cq, 1, &mut wc);
            match rc {
                0 => Ok(None),
                n if n > 0 => Ok(Some(WorkCompletion::from_raw(&wc))),
                _ => Err(io::Error::last_os_error()),
            }
        }
    }
}

impl Drop for CmId {
    fn drop(&mut self) {
        unsafe {
            if self.qp_created {
                rdmacm_sys::rdma_destroy_qp(self.id.as_ptr());
            }
            let rc = rdmacm_sys::rdma_destroy_id(self.id.as_ptr());
            if rc != 0 {
                log::error!("rdma_destroy_id failed: {}", io::Error::last_os_error());
            }
        }
    }
}
