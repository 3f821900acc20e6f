// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Copies the loadable segments of a guest image into guest memory.
//!
//! Parsing the image is left to an [`ImageSource`]; [`elf::ElfImage`] is the
//! implementation used for ELF executables.

pub mod elf;

use crate::vstate::memory::GuestMemoryLayout;
use log::debug;
use vm_memory::{Address, GuestAddress, GuestMemoryError};

/// Errors reported by an [`ImageSource`].
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// The image file cannot be read.
    #[error("Cannot read the image file: {0}")]
    Io(#[source] std::io::Error),
    /// The image is not a valid executable.
    #[error("Cannot parse the image: {0}")]
    Parse(#[source] goblin::error::Error),
    /// The image is valid but not something the guest can run.
    #[error("Unsupported image: {0}")]
    Unsupported(&'static str),
    /// A segment refers to bytes past the end of the file.
    #[error("Segment {0} lies outside of the image file")]
    SegmentOutOfFile(usize),
    /// A segment's file size is larger than its memory size.
    #[error("Segment {0} has more file bytes than memory bytes")]
    InvalidSegment(usize),
    /// The image has not been opened.
    #[error("The image is not open")]
    NotOpen,
    /// `next_segment` was called after the last segment.
    #[error("The image has no more segments")]
    NoMoreSegments,
}

/// A piece of the image to copy to `guest_addr`.
///
/// `data` holds the bytes stored in the image. The segment occupies
/// `mem_size` bytes of guest memory; the part past `data` is zeroed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Segment {
    pub data: Vec<u8>,
    pub mem_size: u64,
    pub guest_addr: GuestAddress,
}

impl Segment {
    /// A segment with no zero fill.
    pub fn new(data: Vec<u8>, guest_addr: GuestAddress) -> Self {
        Segment {
            mem_size: data.len() as u64,
            data,
            guest_addr,
        }
    }

    /// Bytes of guest memory the segment covers.
    pub fn size(&self) -> u64 {
        self.mem_size.max(self.data.len() as u64)
    }
}

const ZERO_CHUNK: [u8; 4096] = [0; 4096];

/// An executable image that can be walked segment by segment.
pub trait ImageSource {
    fn open(&mut self, name: &str) -> Result<(), ImageError>;
    fn has_next_segment(&self) -> bool;
    fn next_segment(&mut self) -> Result<Segment, ImageError>;
    /// Guest address the vcpu starts executing at. Valid after `close`.
    fn entry_address(&self) -> GuestAddress;
    fn close(&mut self);
}

/// Errors associated with loading the image into guest memory.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The image cannot be opened.
    #[error("Cannot open image: {0}")]
    Open(#[source] ImageError),
    /// The next segment cannot be read.
    #[error("Cannot read segment: {0}")]
    Segment(#[source] ImageError),
    /// No loadable region starts at or below the segment address.
    #[error("No memory mapping for guest address {0:#010x}")]
    NoMappingForAddress(u64),
    /// The segment does not fit in the region it starts in.
    #[error(
        "Memory mapping '{region}' too small. Mapping offset: {offset:#010x} - \
        Segment size: {size:#x} - Mapping size: {region_size:#010x}"
    )]
    SegmentExceedsRegion {
        region: String,
        offset: u64,
        size: u64,
        region_size: u64,
    },
    /// Copying into the region failed.
    #[error("Cannot copy segment into guest memory: {0}")]
    Copy(#[source] GuestMemoryError),
}

/// Copies one segment into the loadable region it starts in.
///
/// Nothing is written unless the whole segment, zero fill included, fits.
pub fn load_segment(segment: &Segment, guest_mem: &GuestMemoryLayout) -> Result<(), LoadError> {
    let addr = segment.guest_addr;
    let region = guest_mem
        .find_loadable_region(addr)
        .ok_or(LoadError::NoMappingForAddress(addr.raw_value()))?;

    let offset = addr.raw_value() - region.guest_base().raw_value();
    let size = segment.size();
    match offset.checked_add(size) {
        Some(end) if end <= region.size() => {}
        _ => {
            return Err(LoadError::SegmentExceedsRegion {
                region: region.name().to_string(),
                offset,
                size,
                region_size: region.size(),
            })
        }
    }

    region
        .write_slice(&segment.data, offset)
        .map_err(LoadError::Copy)?;
    let mut fill_at = offset + segment.data.len() as u64;
    let fill_end = offset + size;
    while fill_at < fill_end {
        let len = (fill_end - fill_at).min(ZERO_CHUNK.len() as u64) as usize;
        region
            .write_slice(&ZERO_CHUNK[..len], fill_at)
            .map_err(LoadError::Copy)?;
        fill_at += len as u64;
    }
    debug!(
        "Section loaded. Host address: {:#x} - Guest address: {:#010x}",
        region.host_address() + offset,
        addr.raw_value()
    );
    Ok(())
}

/// Opens `name` through `image` and copies every segment into `guest_mem`.
///
/// The image is closed again whether or not loading succeeds.
pub fn load_image<I: ImageSource + ?Sized>(
    image: &mut I,
    name: &str,
    guest_mem: &GuestMemoryLayout,
) -> Result<(), LoadError> {
    image.open(name).map_err(LoadError::Open)?;
    let result = load_segments(image, guest_mem);
    image.close();
    result
}

fn load_segments<I: ImageSource + ?Sized>(
    image: &mut I,
    guest_mem: &GuestMemoryLayout,
) -> Result<(), LoadError> {
    while image.has_next_segment() {
        let segment = image.next_segment().map_err(LoadError::Segment)?;
        load_segment(&segment, guest_mem)?;
    }
    Ok(())
}
