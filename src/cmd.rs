/// NVMe spec 4.2
/// Submission queue entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C, packed)]
pub struct NvmeCommand {
    /// Opcode
    pub opcode: u8,
    /// Flags; FUSE (2 bits) | Reserved (4 bits) | PSDT (2 bits)
    pub flags: u8,
    /// Command ID
    pub c_id: u16,
    /// Namespace ID
    pub ns_id: u32,
    /// Reserved
    pub _rsvd: u64,
    /// Metadata pointer
    pub md_ptr: u64,
    /// Data pointer
    pub d_ptr: [u64; 2],
    /// Command dword 10
    pub cdw10: u32,
    /// Command dword 11
    pub cdw11: u32,
    /// Command dword 12
    pub cdw12: u32,
    /// Command dword 13
    pub cdw13: u32,
    /// Command dword 14
    pub cdw14: u32,
    /// Command dword 15
    pub cdw15: u32,
}

// admin command set
pub const ADMIN_DELETE_IO_SQ: u8 = 0x00;
pub const ADMIN_CREATE_IO_SQ: u8 = 0x01;
pub const ADMIN_DELETE_IO_CQ: u8 = 0x04;
pub const ADMIN_CREATE_IO_CQ: u8 = 0x05;
pub const ADMIN_IDENTIFY: u8 = 0x06;

// nvm command set
pub const IO_FLUSH: u8 = 0x00;
pub const IO_WRITE: u8 = 0x01;
pub const IO_READ: u8 = 0x02;

// identify CNS values
pub const CNS_NAMESPACE: u32 = 0x00;
pub const CNS_CONTROLLER: u32 = 0x01;
pub const CNS_ACTIVE_NAMESPACES: u32 = 0x02;

impl NvmeCommand {
    pub fn create_io_completion_queue(c_id: u16, qid: u16, ptr: usize, size: u16) -> Self {
        Self {
            opcode: ADMIN_CREATE_IO_CQ,
            c_id,
            d_ptr: [ptr as u64, 0],
            cdw10: ((size as u32) << 16) | (qid as u32),
            cdw11: 1, // physically contiguous, interrupts disabled
            ..Default::default()
        }
    }

    pub fn create_io_submission_queue(
        c_id: u16,
        qid: u16,
        ptr: usize,
        size: u16,
        cqid: u16,
    ) -> Self {
        Self {
            opcode: ADMIN_CREATE_IO_SQ,
            c_id,
            d_ptr: [ptr as u64, 0],
            cdw10: ((size as u32) << 16) | (qid as u32),
            cdw11: ((cqid as u32) << 16) | 1, // physically contiguous
            ..Default::default()
        }
    }

    pub fn delete_io_submission_queue(c_id: u16, qid: u16) -> Self {
        Self {
            opcode: ADMIN_DELETE_IO_SQ,
            c_id,
            cdw10: qid as u32,
            ..Default::default()
        }
    }

    pub fn delete_io_completion_queue(c_id: u16, qid: u16) -> Self {
        Self {
            opcode: ADMIN_DELETE_IO_CQ,
            c_id,
            cdw10: qid as u32,
            ..Default::default()
        }
    }

    pub fn identify_controller(c_id: u16, ptr: usize) -> Self {
        Self {
            opcode: ADMIN_IDENTIFY,
            c_id,
            d_ptr: [ptr as u64, 0],
            cdw10: CNS_CONTROLLER,
            ..Default::default()
        }
    }

    pub fn identify_namespace(c_id: u16, ptr: usize, ns_id: u32) -> Self {
        Self {
            opcode: ADMIN_IDENTIFY,
            c_id,
            ns_id,
            d_ptr: [ptr as u64, 0],
            cdw10: CNS_NAMESPACE,
            ..Default::default()
        }
    }

    pub fn identify_namespace_list(c_id: u16, ptr: usize, base: u32) -> Self {
        Self {
            opcode: ADMIN_IDENTIFY,
            c_id,
            ns_id: base,
            d_ptr: [ptr as u64, 0],
            cdw10: CNS_ACTIVE_NAMESPACES,
            ..Default::default()
        }
    }

    /// Read or write of `blocks` logical blocks (1's based) starting at `lba`.
    pub fn io(
        opcode: u8,
        c_id: u16,
        ns_id: u32,
        lba: u64,
        blocks: u16,
        prp1: u64,
        prp2: u64,
    ) -> Self {
        Self {
            opcode,
            c_id,
            ns_id,
            d_ptr: [prp1, prp2],
            cdw10: lba as u32,
            cdw11: (lba >> 32) as u32,
            cdw12: (blocks - 1) as u32,
            ..Default::default()
        }
    }

    pub fn flush(c_id: u16, ns_id: u32) -> Self {
        Self {
            opcode: IO_FLUSH,
            c_id,
            ns_id,
            ..Default::default()
        }
    }

    pub fn lba(&self) -> u64 {
        (self.cdw10 as u64) | ((self.cdw11 as u64) << 32)
    }

    /// Number of logical blocks (1's based).
    pub fn block_count(&self) -> u32 {
        (self.cdw12 & 0xffff) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_entry_is_64_bytes() {
        assert_eq!(std::mem::size_of::<NvmeCommand>(), 64);
    }

    #[test]
    fn io_command_encodes_range() {
        let cmd = NvmeCommand::io(IO_READ, 7, 1, 0x1_0000_0002, 8, 0x1000, 0);
        assert_eq!(cmd.lba(), 0x1_0000_0002);
        assert_eq!(cmd.block_count(), 8);
        assert_eq!({ cmd.c_id }, 7);
        assert_eq!({ cmd.cdw12 }, 7);
    }

    #[test]
    fn queue_creation_encodes_size_and_id() {
        let cmd = NvmeCommand::create_io_submission_queue(1, 3, 0x2000, 255, 3);
        assert_eq!({ cmd.cdw10 }, (255 << 16) | 3);
        assert_eq!({ cmd.cdw11 } >> 16, 3);
        assert_eq!({ cmd.d_ptr }[0], 0x2000);
    }
}
