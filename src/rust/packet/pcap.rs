// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::packet::Packet;
use crate::runtime::fail::{
    Fail,
    FailKind,
};
use ::byteorder::{
    LittleEndian,
    ReadBytesExt,
    WriteBytesExt,
};
use ::std::io::{
    Read,
    Write,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Magic number of little-endian pcap files with microsecond timestamps.
const PCAP_MAGIC: u32 = 0xa1b2_c3d4;

/// Size of the pcap global header, in bytes. File readers seek past this much when rewinding.
pub const PCAP_GLOBAL_HEADER_SIZE: u64 = 24;

/// Link type recorded in written files: Ethernet.
const PCAP_NETWORK_ETHERNET: u32 = 1;

/// Snapshot length recorded in written files.
const PCAP_SNAPLEN: u32 = 65535;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Pcap global header.
#[derive(Debug, Clone, Copy)]
pub struct PcapGlobalHeader {
    pub magic: u32,
    pub version_major: u16,
    pub version_minor: u16,
    pub thiszone: i32,
    pub sigfigs: u32,
    pub snaplen: u32,
    pub network: u32,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Writes the pcap global header.
pub fn write_global_header<W: Write>(writer: &mut W) -> Result<(), Fail> {
    writer.write_u32::<LittleEndian>(PCAP_MAGIC)?;
    writer.write_u16::<LittleEndian>(2)?;
    writer.write_u16::<LittleEndian>(4)?;
    writer.write_i32::<LittleEndian>(0)?;
    writer.write_u32::<LittleEndian>(0)?;
    writer.write_u32::<LittleEndian>(PCAP_SNAPLEN)?;
    writer.write_u32::<LittleEndian>(PCAP_NETWORK_ETHERNET)?;
    Ok(())
}

/// Reads and validates the pcap global header.
pub fn read_global_header<R: Read>(reader: &mut R) -> Result<PcapGlobalHeader, Fail> {
    let magic: u32 = reader.read_u32::<LittleEndian>()?;
    if magic != PCAP_MAGIC {
        let cause: String = format!("unsupported pcap magic (magic={:#x})", magic);
        error!("read_global_header(): {}", cause);
        return Err(Fail::new(FailKind::Io, &cause));
    }
    Ok(PcapGlobalHeader {
        magic,
        version_major: reader.read_u16::<LittleEndian>()?,
        version_minor: reader.read_u16::<LittleEndian>()?,
        thiszone: reader.read_i32::<LittleEndian>()?,
        sigfigs: reader.read_u32::<LittleEndian>()?,
        snaplen: reader.read_u32::<LittleEndian>()?,
        network: reader.read_u32::<LittleEndian>()?,
    })
}

/// Writes one packet record.
pub fn write_one_packet<W: Write>(writer: &mut W, packet: &Packet) -> Result<(), Fail> {
    let len: u32 = packet.len() as u32;
    writer.write_u32::<LittleEndian>(0)?;
    writer.write_u32::<LittleEndian>(0)?;
    writer.write_u32::<LittleEndian>(len)?;
    writer.write_u32::<LittleEndian>(len)?;
    writer.write_all(packet.data())?;
    Ok(())
}

/// Reads one packet record into `packet`. Returns `true` when the reader is positioned at a clean end of file, in
/// which case `packet` is left untouched.
pub fn read_one_packet<R: Read>(reader: &mut R, packet: &mut Packet) -> Result<bool, Fail> {
    let mut record_header: [u8; 16] = [0; 16];
    let mut filled: usize = 0;
    while filled < record_header.len() {
        let n: usize = reader.read(&mut record_header[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(true);
            }
            return Err(Fail::new(FailKind::Io, "truncated pcap record header"));
        }
        filled += n;
    }

    let mut fields: &[u8] = &record_header[..];
    let _ts_sec: u32 = fields.read_u32::<LittleEndian>()?;
    let _ts_usec: u32 = fields.read_u32::<LittleEndian>()?;
    let incl_len: u32 = fields.read_u32::<LittleEndian>()?;
    let _orig_len: u32 = fields.read_u32::<LittleEndian>()?;

    packet.set_len(incl_len as usize)?;
    if let Err(e) = reader.read_exact(packet.data_mut()) {
        error!("read_one_packet(): truncated pcap record payload");
        return Err(Fail::from(e));
    }
    Ok(false)
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        read_global_header,
        read_one_packet,
        write_global_header,
        write_one_packet,
        PcapGlobalHeader,
        PCAP_GLOBAL_HEADER_SIZE,
    };
    use crate::packet::Packet;
    use crate::runtime::memory::{
        MbufHandle,
        Mempool,
    };
    use ::anyhow::Result;
    use ::std::{
        io::Cursor,
        sync::Arc,
    };

    #[test]
    fn global_header_roundtrip() -> Result<()> {
        let mut buffer: Vec<u8> = Vec::new();
        write_global_header(&mut buffer)?;
        crate::ensure_eq!(buffer.len() as u64, PCAP_GLOBAL_HEADER_SIZE);

        let header: PcapGlobalHeader = read_global_header(&mut Cursor::new(&buffer))?;
        crate::ensure_eq!(header.version_major, 2);
        crate::ensure_eq!(header.version_minor, 4);
        crate::ensure_eq!(header.network, 1);
        Ok(())
    }

    #[test]
    fn bad_magic_is_rejected() -> Result<()> {
        let buffer: [u8; 24] = [0xff; 24];
        crate::ensure_eq!(read_global_header(&mut Cursor::new(&buffer[..])).is_err(), true);
        Ok(())
    }

    #[test]
    fn packet_records_roundtrip() -> Result<()> {
        let pool: Arc<Mempool> = Mempool::new("test", 0, 4)?;
        let payloads: [&[u8]; 3] = [&[1], &[2, 2], &[3, 3, 3]];

        let mut buffer: Vec<u8> = Vec::new();
        write_global_header(&mut buffer)?;
        for payload in &payloads {
            let handle: MbufHandle = pool.alloc_one()?;
            let mut packet: Packet = Packet::extract(handle);
            packet.generate_from_bytes(payload)?;
            write_one_packet(&mut buffer, &packet)?;
            pool.free_bulk(&[handle]);
        }

        let mut cursor: Cursor<&Vec<u8>> = Cursor::new(&buffer);
        read_global_header(&mut cursor)?;
        let handle: MbufHandle = pool.alloc_one()?;
        let mut packet: Packet = Packet::extract(handle);
        for payload in &payloads {
            crate::ensure_eq!(read_one_packet(&mut cursor, &mut packet)?, false);
            crate::ensure_eq!(packet.data(), *payload);
        }
        crate::ensure_eq!(read_one_packet(&mut cursor, &mut packet)?, true);
        pool.free_bulk(&[handle]);
        Ok(())
    }
}
