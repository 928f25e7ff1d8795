/// Neutron floppy image layout (boot code + nFS).
///
/// Lays out the full 1.44 MB image in one sequential pass:
///
/// Layout (512-byte sectors):
///   Sectors 0-4:  Concatenated module code, zero padded to byte 2560
///   Sector 5:     nFS header (magic, volume name, version bytes)
///   Sector 6:     Directory table, 16 records of 32 bytes
///   Sectors 7..:  File data, each file rounded up to whole sectors
///   Remainder:    Zero fill to 2880 sectors
///
/// These offsets are read by the boot code, so they are fixed constants.
use crate::assembler::AssembledModule;
use crate::error::{BuildError, Region, Result};
use crate::manifest::FileEntry;
use crate::sink::ImageWriter;
use log::{debug, info, warn};
use std::io::Write;

pub const SECTOR_SIZE: u64 = 512;
/// Total size of a 3.5" high-density floppy.
pub const IMAGE_SIZE: u64 = 2880 * SECTOR_SIZE;
/// End of the code region and start of the nFS header.
pub const CODE_REGION_END: u64 = 5 * SECTOR_SIZE;

pub const NFS_MAGIC: u32 = 0xDEADF500;
pub const NFS_VOLUME_NAME: &str = "NEUTRON TEST FS";
const NFS_TERMINATOR: u8 = 0;
const NFS_VERSION: u8 = 1;
const NFS_FLAGS: u8 = 1;
/// Bytes of the header that carry data; the rest of the sector is zero.
pub const NFS_HEADER_LEN: u64 = 4 + NFS_VOLUME_NAME.len() as u64 + 3;

pub const DIRECTORY_OFFSET: u64 = CODE_REGION_END + SECTOR_SIZE;
pub const DIRECTORY_RECORD_SIZE: u64 = 32;
pub const MAX_DIRECTORY_RECORDS: usize = (SECTOR_SIZE / DIRECTORY_RECORD_SIZE) as usize;
pub const FILE_NAME_LEN: usize = 23;
/// First sector of file data: header sector + directory sector after the code.
pub const FIRST_DATA_SECTOR: u32 = 7;
/// Bytes from the first data sector to the end of the image.
pub const DATA_REGION_CAPACITY: u64 = IMAGE_SIZE - FIRST_DATA_SECTOR as u64 * SECTOR_SIZE;

/// A file entry with its source contents loaded.
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub entry: FileEntry,
    pub data: Vec<u8>,
}

/// One 32-byte directory table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub name: String,
    pub size: u32,
    pub start_sector: u32,
    pub sector_count: u32,
}

impl DirectoryRecord {
    fn write<W: Write>(&self, out: &mut ImageWriter<W>) -> Result<()> {
        // name[23], reserved, size, start sector
        out.write_fixed_str(&self.name, FILE_NAME_LEN)?;
        out.write_u8(0)?;
        out.write_u32_le(self.size)?;
        out.write_u32_le(self.start_sector)?;
        Ok(())
    }
}

/// Directory records with their sector assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutPlan {
    pub records: Vec<DirectoryRecord>,
}

impl LayoutPlan {
    /// First sector after the last file.
    pub fn end_sector(&self) -> u32 {
        self.records
            .last()
            .map_or(FIRST_DATA_SECTOR, |r| r.start_sector + r.sector_count)
    }
}

/// Totals reported after a successful layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSummary {
    pub code_bytes: u64,
    pub file_count: usize,
    pub data_sectors: u32,
    pub image_size: u64,
}

/// Appended code size, checked against the code region before any file is read.
pub fn check_code_region(modules: &[AssembledModule]) -> Result<u64> {
    let used: u64 = modules
        .iter()
        .filter(|m| m.entry.append)
        .map(|m| m.blob.len() as u64)
        .sum();
    if used > CODE_REGION_END {
        return Err(BuildError::CapacityExceeded {
            region: Region::CodeRegion,
            required: used,
            available: CODE_REGION_END,
        });
    }
    Ok(used)
}

/// Whole sectors needed for `size` bytes of file data.
pub fn sectors_for(size: u64) -> u64 {
    size.div_ceil(SECTOR_SIZE)
}

/// Assign sizes and start sectors to every file, in order.
pub fn plan(files: &[ResolvedFile]) -> Result<LayoutPlan> {
    let table_bytes = files.len() as u64 * DIRECTORY_RECORD_SIZE;
    if files.len() > MAX_DIRECTORY_RECORDS {
        return Err(BuildError::CapacityExceeded {
            region: Region::DirectoryTable,
            required: table_bytes,
            available: SECTOR_SIZE,
        });
    }

    let mut records = Vec::with_capacity(files.len());
    let mut next_sector = FIRST_DATA_SECTOR;

    for file in files {
        let size = record_field(file.data.len() as u64)?;
        let sector_count = record_field(sectors_for(size as u64))?;

        let name = &file.entry.dest_name;
        if name.len() > FILE_NAME_LEN {
            warn!(
                "File name {:?} is longer than {} bytes and will be truncated",
                name, FILE_NAME_LEN
            );
        }

        records.push(DirectoryRecord {
            name: name.clone(),
            size,
            start_sector: next_sector,
            sector_count,
        });
        next_sector = record_field(next_sector as u64 + sector_count as u64)?;
    }

    Ok(LayoutPlan { records })
}

fn record_field(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| BuildError::CapacityExceeded {
        region: Region::RecordField,
        required: value,
        available: u32::MAX as u64,
    })
}

/// Write the complete image to `out`.
///
/// `out` must be fresh: the phases check absolute offsets against its cursor.
pub fn write_image<W: Write>(
    out: &mut ImageWriter<W>,
    modules: &[AssembledModule],
    files: &[ResolvedFile],
) -> Result<ImageSummary> {
    write_code_region(out, modules)?;
    let code_bytes = out.position();

    let pad = out.pad_to(CODE_REGION_END, Region::CodeRegion)?;
    debug!("Code region: {} bytes used, {} bytes padding", code_bytes, pad);

    write_header(out)?;

    let layout = plan(files)?;
    write_directory(out, &layout)?;
    write_file_data(out, &layout, files)?;

    let pad = out.pad_to(IMAGE_SIZE, Region::Image)?;
    info!("Padding image with {} zero bytes", pad);

    Ok(ImageSummary {
        code_bytes,
        file_count: layout.records.len(),
        data_sectors: layout.end_sector() - FIRST_DATA_SECTOR,
        image_size: out.position(),
    })
}

fn write_code_region<W: Write>(
    out: &mut ImageWriter<W>,
    modules: &[AssembledModule],
) -> Result<()> {
    for module in modules {
        if !module.entry.append {
            info!(
                "Skipping {:?} ({} bytes, not appended)",
                module.entry.source,
                module.blob.len()
            );
            continue;
        }
        info!(
            "Appending {:?} at offset {} ({} bytes)",
            module.entry.source,
            out.position(),
            module.blob.len()
        );
        out.write_bytes(&module.blob)?;
    }
    Ok(())
}

fn write_header<W: Write>(out: &mut ImageWriter<W>) -> Result<()> {
    info!("Writing nFS header at offset {}", out.position());
    out.write_u32_le(NFS_MAGIC)?;
    out.write_bytes(NFS_VOLUME_NAME.as_bytes())?;
    out.write_u8(NFS_TERMINATOR)?;
    out.write_u8(NFS_VERSION)?;
    out.write_u8(NFS_FLAGS)?;
    out.write_zeros(SECTOR_SIZE - NFS_HEADER_LEN)?;
    Ok(())
}

fn write_directory<W: Write>(out: &mut ImageWriter<W>, layout: &LayoutPlan) -> Result<()> {
    for record in &layout.records {
        debug!(
            "Directory entry {:?}: {} bytes at sector {} ({} sectors)",
            record.name, record.size, record.start_sector, record.sector_count
        );
        record.write(out)?;
    }
    out.pad_to(DIRECTORY_OFFSET + SECTOR_SIZE, Region::DirectoryTable)?;
    Ok(())
}

fn write_file_data<W: Write>(
    out: &mut ImageWriter<W>,
    layout: &LayoutPlan,
    files: &[ResolvedFile],
) -> Result<()> {
    for (record, file) in layout.records.iter().zip(files) {
        info!(
            "Writing {:?} -> {} at offset {}",
            file.entry.source,
            record.name,
            out.position()
        );
        out.write_bytes(&file.data)?;
        let slack = record.sector_count as u64 * SECTOR_SIZE - record.size as u64;
        out.write_zeros(slack)?;
    }
    Ok(())
}
