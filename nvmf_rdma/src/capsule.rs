//! NVMe-oF capsule wire formats.
//!
//! A command capsule is a 64-byte submission queue entry followed by
//! optional in-capsule data; a response capsule is a 16-byte completion
//! queue entry. The transport also speaks three small RDMA CM private-data
//! blocks during connection establishment.

/// Command capsule (submission queue entry) size in bytes.
pub const CMD_CAPSULE_SIZE: usize = 64;

/// Response capsule (completion queue entry) size in bytes.
pub const RSP_CAPSULE_SIZE: usize = 16;

/// Fabrics command opcode.
pub const OPC_FABRIC: u8 = 0x7f;

/// Fabrics command type: CONNECT.
pub const FCTYPE_CONNECT: u8 = 0x01;

// Generic command status codes stamped by the transport.
pub const SC_SUCCESS: u8 = 0x00;
pub const SC_INTERNAL_DEVICE_ERROR: u8 = 0x06;
pub const SC_DATA_SGL_LENGTH_INVALID: u8 = 0x0c;
pub const SC_SGL_DESCRIPTOR_TYPE_INVALID: u8 = 0x0e;
pub const SC_INVALID_SGL_OFFSET: u8 = 0x16;

// SGL descriptor types and subtypes (byte 15 of the descriptor).
pub const SGL_TYPE_DATA_BLOCK: u8 = 0x0;
pub const SGL_TYPE_KEYED_DATA_BLOCK: u8 = 0x4;
pub const SGL_SUBTYPE_ADDRESS: u8 = 0x0;
pub const SGL_SUBTYPE_OFFSET: u8 = 0x1;
pub const SGL_SUBTYPE_INVALIDATE_KEY: u8 = 0xf;

/// Data transfer direction, encoded in the low two bits of the opcode (or
/// of the fabrics command type for fabrics capsules).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTransfer {
    None,
    HostToController,
    ControllerToHost,
    Bidirectional,
}

impl DataTransfer {
    #[inline]
    pub fn from_opcode(opc: u8) -> Self {
        match opc & 0x3 {
            0 => DataTransfer::None,
            1 => DataTransfer::HostToController,
            2 => DataTransfer::ControllerToHost,
            _ => DataTransfer::Bidirectional,
        }
    }
}

/// 64-byte NVMe command capsule.
///
/// For fabrics capsules (`opc == OPC_FABRIC`) the byte at offset 4 carries
/// the fabrics command type instead of a namespace id.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NvmeCmd {
    pub opc: u8,
    pub fuse_psdt: u8,
    pub cid: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    /// SGL descriptor 1 (the data pointer).
    pub dptr: [u8; 16],
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl NvmeCmd {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    /// Fabrics command type; meaningful only when `opc == OPC_FABRIC`.
    #[inline]
    pub fn fctype(&self) -> u8 {
        (self.nsid & 0xff) as u8
    }

    /// Data transfer direction of this command.
    #[inline]
    pub fn data_transfer(&self) -> DataTransfer {
        if self.opc == OPC_FABRIC {
            DataTransfer::from_opcode(self.fctype())
        } else {
            DataTransfer::from_opcode(self.opc)
        }
    }

    /// Decode SGL descriptor 1.
    #[inline]
    pub fn sgl1(&self) -> SglDescriptor {
        SglDescriptor::parse(&self.dptr)
    }

    /// Encode a keyed data block descriptor into SGL 1.
    pub fn set_sgl1_keyed(&mut self, address: u64, length: u32, key: u32, subtype: u8) {
        self.dptr[0..8].copy_from_slice(&address.to_le_bytes());
        self.dptr[8..11].copy_from_slice(&length.to_le_bytes()[0..3]);
        self.dptr[11..15].copy_from_slice(&key.to_le_bytes());
        self.dptr[15] = (SGL_TYPE_KEYED_DATA_BLOCK << 4) | (subtype & 0xf);
    }

    /// Encode an in-capsule offset descriptor into SGL 1.
    pub fn set_sgl1_in_capsule(&mut self, offset: u64, length: u32) {
        self.dptr[0..8].copy_from_slice(&offset.to_le_bytes());
        self.dptr[8..12].copy_from_slice(&length.to_le_bytes());
        self.dptr[12..15].fill(0);
        self.dptr[15] = (SGL_TYPE_DATA_BLOCK << 4) | SGL_SUBTYPE_OFFSET;
    }
}

/// Decoded SGL descriptor 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SglDescriptor {
    /// Keyed data block: remote address and key for RDMA READ/WRITE.
    Keyed {
        address: u64,
        length: u32,
        key: u32,
        subtype: u8,
    },
    /// Plain data block: for the OFFSET subtype, `address` is the byte
    /// offset into the in-capsule data.
    Unkeyed {
        address: u64,
        length: u32,
        subtype: u8,
    },
    /// Anything the transport does not support.
    Other { sgl_type: u8, subtype: u8 },
}

impl SglDescriptor {
    pub fn parse(raw: &[u8; 16]) -> Self {
        let sgl_type = raw[15] >> 4;
        let subtype = raw[15] & 0xf;
        let address = u64::from_le_bytes(raw[0..8].try_into().unwrap());

        match sgl_type {
            SGL_TYPE_KEYED_DATA_BLOCK => {
                let length =
                    u32::from(raw[8]) | (u32::from(raw[9]) << 8) | (u32::from(raw[10]) << 16);
                let key = u32::from_le_bytes(raw[11..15].try_into().unwrap());
                SglDescriptor::Keyed {
                    address,
                    length,
                    key,
                    subtype,
                }
            }
            SGL_TYPE_DATA_BLOCK => {
                let length = u32::from_le_bytes(raw[8..12].try_into().unwrap());
                SglDescriptor::Unkeyed {
                    address,
                    length,
                    subtype,
                }
            }
            _ => SglDescriptor::Other { sgl_type, subtype },
        }
    }
}

/// 16-byte NVMe completion capsule.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NvmeCpl {
    pub cdw0: u32,
    pub rsvd1: u32,
    /// Submission queue head pointer echoed to the host.
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    /// Phase bit, status code, status code type, more, do-not-retry.
    status: u16,
}

impl NvmeCpl {
    /// Reset the completion to all zeroes.
    #[inline]
    pub fn clear(&mut self) {
        *self = unsafe { std::mem::zeroed() };
    }

    /// Status code (bits 8:1 of the status field).
    #[inline]
    pub fn sc(&self) -> u8 {
        ((self.status >> 1) & 0xff) as u8
    }

    /// Set the status code, leaving the other status bits untouched.
    #[inline]
    pub fn set_sc(&mut self, sc: u8) {
        self.status = (self.status & !(0xff << 1)) | ((sc as u16) << 1);
    }

    /// Status code type (bits 11:9).
    #[inline]
    pub fn sct(&self) -> u8 {
        ((self.status >> 9) & 0x7) as u8
    }

    #[inline]
    pub fn status_raw(&self) -> u16 {
        self.status
    }
}

/// CM private data sent by the host with a connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPrivateData {
    pub recfmt: u16,
    pub qid: u16,
    /// Host receive queue size.
    pub hrqsize: u16,
    /// Host send queue size.
    pub hsqsize: u16,
}

/// Wire size of the host connection-request private data block.
pub const REQUEST_PRIVATE_DATA_SIZE: usize = 32;

impl RequestPrivateData {
    /// Decode host private data. Blocks shorter than the documented length
    /// are ignored (the host values are optional).
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < REQUEST_PRIVATE_DATA_SIZE {
            return None;
        }
        Some(Self {
            recfmt: u16::from_le_bytes(raw[0..2].try_into().unwrap()),
            qid: u16::from_le_bytes(raw[2..4].try_into().unwrap()),
            hrqsize: u16::from_le_bytes(raw[4..6].try_into().unwrap()),
            hsqsize: u16::from_le_bytes(raw[6..8].try_into().unwrap()),
        })
    }

    pub fn to_bytes(&self) -> [u8; REQUEST_PRIVATE_DATA_SIZE] {
        let mut raw = [0u8; REQUEST_PRIVATE_DATA_SIZE];
        raw[0..2].copy_from_slice(&self.recfmt.to_le_bytes());
        raw[2..4].copy_from_slice(&self.qid.to_le_bytes());
        raw[4..6].copy_from_slice(&self.hrqsize.to_le_bytes());
        raw[6..8].copy_from_slice(&self.hsqsize.to_le_bytes());
        raw
    }
}

/// CM private data returned by the target on accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptPrivateData {
    pub recfmt: u16,
    /// Controller receive queue size granted to the host.
    pub crqsize: u16,
}

/// Wire size of the accept private data block.
pub const ACCEPT_PRIVATE_DATA_SIZE: usize = 32;

impl AcceptPrivateData {
    pub fn to_bytes(&self) -> [u8; ACCEPT_PRIVATE_DATA_SIZE] {
        let mut raw = [0u8; ACCEPT_PRIVATE_DATA_SIZE];
        raw[0..2].copy_from_slice(&self.recfmt.to_le_bytes());
        raw[2..4].copy_from_slice(&self.crqsize.to_le_bytes());
        raw
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < 4 {
            return None;
        }
        Some(Self {
            recfmt: u16::from_le_bytes(raw[0..2].try_into().unwrap()),
            crqsize: u16::from_le_bytes(raw[2..4].try_into().unwrap()),
        })
    }
}

/// CM private data returned by the target on reject: the NVMe status the
/// host should report for the failed connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectPrivateData {
    pub recfmt: u16,
    /// NVMe status field with the status code at bits 8:1.
    pub sts: u16,
}

impl RejectPrivateData {
    pub fn with_sc(sc: u8) -> Self {
        Self {
            recfmt: 0,
            sts: (sc as u16) << 1,
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let mut raw = [0u8; 4];
        raw[0..2].copy_from_slice(&self.recfmt.to_le_bytes());
        raw[2..4].copy_from_slice(&self.sts.to_le_bytes());
        raw
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < 4 {
            return None;
        }
        Some(Self {
            recfmt: u16::from_le_bytes(raw[0..2].try_into().unwrap()),
            sts: u16::from_le_bytes(raw[2..4].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capsule_sizes() {
        assert_eq!(std::mem::size_of::<NvmeCmd>(), CMD_CAPSULE_SIZE);
        assert_eq!(std::mem::size_of::<NvmeCpl>(), RSP_CAPSULE_SIZE);
    }

    #[test]
    fn data_transfer_from_opcode() {
        assert_eq!(DataTransfer::from_opcode(0x00), DataTransfer::None);
        // NVMe write: host to controller
        assert_eq!(
            DataTransfer::from_opcode(0x01),
            DataTransfer::HostToController
        );
        // NVMe read: controller to host
        assert_eq!(
            DataTransfer::from_opcode(0x02),
            DataTransfer::ControllerToHost
        );
        assert_eq!(DataTransfer::from_opcode(0x03), DataTransfer::Bidirectional);
    }

    #[test]
    fn fabrics_direction_uses_fctype() {
        let mut cmd = NvmeCmd::zeroed();
        cmd.opc = OPC_FABRIC;
        cmd.nsid = FCTYPE_CONNECT as u32;
        assert_eq!(cmd.fctype(), FCTYPE_CONNECT);
        assert_eq!(cmd.data_transfer(), DataTransfer::HostToController);
    }

    #[test]
    fn keyed_sgl_roundtrip() {
        let mut cmd = NvmeCmd::zeroed();
        cmd.set_sgl1_keyed(0xdead_beef_0000_1000, 0x12_3456, 0xabcd_ef01, SGL_SUBTYPE_ADDRESS);
        match cmd.sgl1() {
            SglDescriptor::Keyed {
                address,
                length,
                key,
                subtype,
            } => {
                assert_eq!(address, 0xdead_beef_0000_1000);
                assert_eq!(length, 0x12_3456);
                assert_eq!(key, 0xabcd_ef01);
                assert_eq!(subtype, SGL_SUBTYPE_ADDRESS);
            }
            other => panic!("wrong descriptor: {:?}", other),
        }
    }

    #[test]
    fn in_capsule_sgl_roundtrip() {
        let mut cmd = NvmeCmd::zeroed();
        cmd.set_sgl1_in_capsule(512, 1024);
        match cmd.sgl1() {
            SglDescriptor::Unkeyed {
                address,
                length,
                subtype,
            } => {
                assert_eq!(address, 512);
                assert_eq!(length, 1024);
                assert_eq!(subtype, SGL_SUBTYPE_OFFSET);
            }
            other => panic!("wrong descriptor: {:?}", other),
        }
    }

    #[test]
    fn reserved_sgl_type_is_other() {
        let mut raw = [0u8; 16];
        raw[15] = 0x2 << 4; // segment descriptor
        assert_eq!(
            SglDescriptor::parse(&raw),
            SglDescriptor::Other {
                sgl_type: 0x2,
                subtype: 0
            }
        );
    }

    #[test]
    fn cpl_status_accessors() {
        let mut cpl: NvmeCpl = unsafe { std::mem::zeroed() };
        cpl.set_sc(SC_DATA_SGL_LENGTH_INVALID);
        assert_eq!(cpl.sc(), SC_DATA_SGL_LENGTH_INVALID);
        assert_eq!(cpl.sct(), 0);
        // Phase bit untouched by set_sc.
        assert_eq!(cpl.status_raw() & 1, 0);
        cpl.set_sc(SC_SUCCESS);
        assert_eq!(cpl.sc(), SC_SUCCESS);
    }

    #[test]
    fn private_data_roundtrip() {
        let req = RequestPrivateData {
            recfmt: 0,
            qid: 1,
            hrqsize: 64,
            hsqsize: 63,
        };
        assert_eq!(RequestPrivateData::from_bytes(&req.to_bytes()), Some(req));
        // Short blocks are ignored.
        assert_eq!(RequestPrivateData::from_bytes(&[0u8; 8]), None);

        let accept = AcceptPrivateData {
            recfmt: 0,
            crqsize: 128,
        };
        assert_eq!(
            AcceptPrivateData::from_bytes(&accept.to_bytes()),
            Some(accept)
        );

        let rej = RejectPrivateData::with_sc(SC_INTERNAL_DEVICE_ERROR);
        let decoded = RejectPrivateData::from_bytes(&rej.to_bytes()).unwrap();
        assert_eq!((decoded.sts >> 1) & 0xff, SC_INTERNAL_DEVICE_ERROR as u16);
    }
}
