//! Validated construction of read/write commands.
//!
//! Building a command has no side effects: nothing is submitted and no queue
//! slot is taken until the command is handed to
//! [`NvmeQueuePair::submit_io`](crate::queues::NvmeQueuePair::submit_io).

use crate::cmd::{IO_READ, IO_WRITE};
use crate::error::{Error, Result};
use crate::memory::DmaBuffer;
use crate::NvmeNamespace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOpcode {
    Read,
    Write,
}

impl IoOpcode {
    pub fn opcode(self) -> u8 {
        match self {
            IoOpcode::Read => IO_READ,
            IoOpcode::Write => IO_WRITE,
        }
    }
}

/// A read or write that passed range and buffer checks.
#[derive(Debug)]
pub struct IoCommand<'a> {
    pub opcode: IoOpcode,
    pub namespace_id: u32,
    pub lba: u64,
    pub block_count: u32,
    pub buffer: &'a DmaBuffer,
    block_size: u64,
}

impl IoCommand<'_> {
    /// Bytes moved by this command.
    pub fn transfer_len(&self) -> usize {
        (self.block_count as u64 * self.block_size) as usize
    }
}

/// Builds commands for one namespace under a controller's transfer limit.
#[derive(Debug, Clone, Copy)]
pub struct CommandBuilder {
    namespace: NvmeNamespace,
    max_blocks: u64,
}

impl CommandBuilder {
    pub fn new(namespace: NvmeNamespace, max_transfer_bytes: usize) -> Self {
        Self {
            namespace,
            max_blocks: (max_transfer_bytes as u64 / namespace.block_size).max(1),
        }
    }

    /// Largest block count a single command may carry.
    pub fn max_blocks(&self) -> u64 {
        self.max_blocks
    }

    pub fn build_read<'a>(
        &self,
        lba: u64,
        block_count: u64,
        buffer: &'a DmaBuffer,
    ) -> Result<IoCommand<'a>> {
        self.build(IoOpcode::Read, lba, block_count, buffer)
    }

    pub fn build_write<'a>(
        &self,
        lba: u64,
        block_count: u64,
        buffer: &'a DmaBuffer,
    ) -> Result<IoCommand<'a>> {
        self.build(IoOpcode::Write, lba, block_count, buffer)
    }

    fn build<'a>(
        &self,
        opcode: IoOpcode,
        lba: u64,
        block_count: u64,
        buffer: &'a DmaBuffer,
    ) -> Result<IoCommand<'a>> {
        let invalid = |reason: &'static str| Error::InvalidRange {
            lba,
            blocks: block_count,
            reason,
        };
        if block_count == 0 {
            return Err(invalid("empty transfer"));
        }
        if block_count > self.max_blocks {
            return Err(invalid("exceeds maximum transfer size"));
        }
        match lba.checked_add(block_count) {
            Some(end) if end <= self.namespace.blocks => {}
            _ => return Err(invalid("beyond end of namespace")),
        }

        let needed = (block_count * self.namespace.block_size) as usize;
        if buffer.len() < needed {
            return Err(Error::BufferTooSmall {
                needed,
                available: buffer.len(),
            });
        }

        Ok(IoCommand {
            opcode,
            namespace_id: self.namespace.id,
            lba,
            block_count: block_count as u32,
            buffer,
            block_size: self.namespace.block_size,
        })
    }
}
