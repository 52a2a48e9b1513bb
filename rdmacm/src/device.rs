//! RDMA device enumeration and attribute queries.

use std::ffi::CStr;
use std::{io, mem::MaybeUninit, ops::Deref, ptr::NonNull};

pub struct Device {
    device: NonNull<rdmacm_sys::ibv_device>,
}

pub struct DeviceList {
    list: NonNull<*mut rdmacm_sys::ibv_device>,
    list_ref: Box<[Device]>,
}

impl DeviceList {
    /// Enumerate the verbs devices visible to this process. An empty list is
    /// not an error; a missing provider stack is.
    pub fn list() -> io::Result<Self> {
        unsafe {
            let mut num_devices = MaybeUninit::uninit();
            let list = rdmacm_sys::ibv_get_device_list(num_devices.as_mut_ptr());
            let Some(list) = NonNull::new(list) else {
                return Err(io::Error::last_os_error());
            };
            let len = num_devices.assume_init() as usize;
            let list_ref = (0..len)
                .map(|i| Device {
                    device: NonNull::new_unchecked(*list.as_ptr().add(i)),
                })
                .collect();
            Ok(Self { list, list_ref })
        }
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        unsafe {
            rdmacm_sys::ibv_free_device_list(self.list.as_ptr());
        }
    }
}

impl Deref for DeviceList {
    type Target = [Device];
    fn deref(&self) -> &Self::Target {
        &self.list_ref
    }
}

impl Device {
    pub fn name(&self) -> String {
        unsafe {
            let name = rdmacm_sys::ibv_get_device_name(self.device.as_ptr());
            if name.is_null() {
                String::from("<unknown>")
            } else {
                CStr::from_ptr(name).to_string_lossy().into_owned()
            }
        }
    }

    pub fn open(&self) -> io::Result<Context> {
        unsafe {
            let ctx = rdmacm_sys::ibv_open_device(self.device.as_ptr());
            NonNull::new(ctx).map_or(Err(io::Error::last_os_error()), |ctx| Ok(Context { ctx }))
        }
    }
}

/// Open device context. Closed when dropped.
pub struct Context {
    ctx: NonNull<rdmacm_sys::ibv_context>,
}

impl Context {
    pub fn query_device(&self) -> io::Result<DeviceAttr> {
        unsafe { query_device_raw(self.ctx.as_ptr()) }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            rdmacm_sys::ibv_close_device(self.ctx.as_ptr());
        }
    }
}

pub(crate) unsafe fn query_device_raw(
    ctx: *mut rdmacm_sys::ibv_context,
) -> io::Result<DeviceAttr> {
    let mut attr = MaybeUninit::<rdmacm_sys::ibv_device_attr>::uninit();
    let rc = rdmacm_sys::ibv_query_device(ctx, attr.as_mut_ptr());
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(DeviceAttr {
        attr: attr.assume_init(),
    })
}

/// Device attributes relevant to queue sizing and resource limits.
#[derive(Clone, Copy)]
pub struct DeviceAttr {
    attr: rdmacm_sys::ibv_device_attr,
}

impl DeviceAttr {
    pub fn max_mr_size(&self) -> u64 {
        self.attr.max_mr_size
    }

    pub fn page_size_cap(&self) -> u64 {
        self.attr.page_size_cap
    }

    pub fn max_qp(&self) -> i32 {
        self.attr.max_qp
    }

    /// Maximum outstanding work requests on any queue of a QP.
    pub fn max_qp_wr(&self) -> i32 {
        self.attr.max_qp_wr
    }

    pub fn max_sge(&self) -> i32 {
        self.attr.max_sge
    }

    pub fn max_cq(&self) -> i32 {
        self.attr.max_cq
    }

    pub fn max_cqe(&self) -> i32 {
        self.attr.max_cqe
    }

    pub fn max_mr(&self) -> i32 {
        self.attr.max_mr
    }

    pub fn max_pd(&self) -> i32 {
        self.attr.max_pd
    }

    /// Maximum incoming RDMA READ/atomic operations per QP.
    pub fn max_qp_rd_atom(&self) -> i32 {
        self.attr.max_qp_rd_atom
    }

    pub fn max_qp_init_rd_atom(&self) -> i32 {
        self.attr.max_qp_init_rd_atom
    }

    pub fn max_res_rd_atom(&self) -> i32 {
        self.attr.max_res_rd_atom
    }

    pub fn max_srq(&self) -> i32 {
        self.attr.max_srq
    }

    pub fn max_srq_wr(&self) -> i32 {
        self.attr.max_srq_wr
    }

    pub fn max_srq_sge(&self) -> i32 {
        self.attr.max_srq_sge
    }

    pub fn max_pkeys(&self) -> u16 {
        self.attr.max_pkeys
    }

    pub fn phys_port_cnt(&self) -> u8 {
        self.attr.phys_port_cnt
    }
}
