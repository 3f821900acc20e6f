// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{ImageError, ImageSource, Segment};
use goblin::elf::{
    header::{EI_CLASS, EI_DATA, ELFCLASS64, ELFDATA2LSB, EM_AARCH64},
    program_header::{ProgramHeader, PT_INTERP, PT_LOAD},
    Elf,
};
use log::debug;
use std::collections::VecDeque;
use vm_memory::GuestAddress;

/// Loadable part of a program header, kept after the file is parsed.
#[derive(Debug, Copy, Clone)]
struct LoadHeader {
    index: usize,
    offset: usize,
    file_size: usize,
    mem_size: u64,
    phys_addr: u64,
}

/// A bare-metal aarch64 ELF64 executable.
///
/// Every `PT_LOAD` header with a non-zero memory size becomes one segment,
/// placed at its physical address. Only the file bytes are read; the loader
/// zeroes the rest up to the memory size once it fits the target region.
#[derive(Debug, Default)]
pub struct ElfImage {
    bytes: Vec<u8>,
    headers: VecDeque<LoadHeader>,
    entry: u64,
    open: bool,
}

impl ElfImage {
    pub fn new() -> Self {
        Default::default()
    }

    /// Parses an image that is already in memory.
    pub fn open_bytes(&mut self, bytes: Vec<u8>) -> Result<(), ImageError> {
        let (entry, headers) = {
            let elf = Elf::parse(&bytes).map_err(ImageError::Parse)?;
            validate(&elf)?;
            let headers = elf
                .program_headers
                .iter()
                .enumerate()
                .filter(|(_, ph)| ph.p_type == PT_LOAD && ph.p_memsz > 0)
                .map(|(index, ph)| load_header(index, ph, bytes.len()))
                .collect::<Result<VecDeque<_>, _>>()?;
            (elf.entry, headers)
        };
        if headers.is_empty() {
            return Err(ImageError::Unsupported("no loadable segments"));
        }
        debug!(
            "Opened ELF image: {} loadable segments, entry {:#010x}",
            headers.len(),
            entry
        );
        self.bytes = bytes;
        self.headers = headers;
        self.entry = entry;
        self.open = true;
        Ok(())
    }
}

fn validate(elf: &Elf) -> Result<(), ImageError> {
    let ident = &elf.header.e_ident;
    if ident[EI_CLASS] != ELFCLASS64 {
        return Err(ImageError::Unsupported("not a 64-bit ELF"));
    }
    if ident[EI_DATA] != ELFDATA2LSB {
        return Err(ImageError::Unsupported("not a little-endian ELF"));
    }
    if elf.header.e_machine != EM_AARCH64 {
        return Err(ImageError::Unsupported("not an aarch64 ELF"));
    }
    if elf.program_headers.iter().any(|ph| ph.p_type == PT_INTERP) {
        return Err(ImageError::Unsupported("dynamically linked ELF"));
    }
    Ok(())
}

fn load_header(
    index: usize,
    ph: &ProgramHeader,
    file_len: usize,
) -> Result<LoadHeader, ImageError> {
    if ph.p_filesz > ph.p_memsz {
        return Err(ImageError::InvalidSegment(index));
    }
    let offset = usize::try_from(ph.p_offset).map_err(|_| ImageError::SegmentOutOfFile(index))?;
    let file_size =
        usize::try_from(ph.p_filesz).map_err(|_| ImageError::SegmentOutOfFile(index))?;
    match offset.checked_add(file_size) {
        Some(end) if end <= file_len => {}
        _ => return Err(ImageError::SegmentOutOfFile(index)),
    }
    Ok(LoadHeader {
        index,
        offset,
        file_size,
        mem_size: ph.p_memsz,
        phys_addr: ph.p_paddr,
    })
}

impl ImageSource for ElfImage {
    fn open(&mut self, name: &str) -> Result<(), ImageError> {
        let bytes = std::fs::read(name).map_err(ImageError::Io)?;
        self.open_bytes(bytes)
    }

    fn has_next_segment(&self) -> bool {
        self.open && !self.headers.is_empty()
    }

    fn next_segment(&mut self) -> Result<Segment, ImageError> {
        if !self.open {
            return Err(ImageError::NotOpen);
        }
        let header = self.headers.pop_front().ok_or(ImageError::NoMoreSegments)?;
        let data = self.bytes[header.offset..header.offset + header.file_size].to_vec();
        debug!(
            "Segment {}: {:#x} file bytes, {:#x} memory bytes at {:#010x}",
            header.index, header.file_size, header.mem_size, header.phys_addr
        );
        Ok(Segment {
            data,
            mem_size: header.mem_size,
            guest_addr: GuestAddress(header.phys_addr),
        })
    }

    fn entry_address(&self) -> GuestAddress {
        GuestAddress(self.entry)
    }

    fn close(&mut self) {
        self.bytes = Vec::new();
        self.headers.clear();
        self.open = false;
    }
}
