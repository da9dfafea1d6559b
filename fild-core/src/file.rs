//! File service: PUT, GET and ACTION on paths under the inbox directory.
//!
//! Every NAME is appended verbatim to the inbox prefix. One object (file or directory
//! listing) is open at a time; it is dropped when its operation completes or fails.

use std::io::{Read, Seek, SeekFrom, Write};
use std::mem;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::chunk::ChunkDescriptor;
use crate::error::ObexError;
use crate::fs::{FileSystem, ObjectFile, ObjectKind, OpenMode, DIR_RECORD_LEN};
use crate::integrity::{self, MD5_DIGEST_LEN};
use crate::protocol::{
    ActionId, HeaderId, Opcode, ResponseCode, BUFFER_SIZE, MAX_FILENAME_LEN, MD5_TYPE,
};
use crate::server::{ObexServer, ObexService, Outcome, RegisterError, Request};
use crate::wire::{decode_unicode, Header, HeaderValue};

static ZEROS: [u8; BUFFER_SIZE] = [0; BUFFER_SIZE];

enum OpenObject<H> {
    Idle,
    Writing(H),
    Reading { file: H, offset: u64, end: u64 },
    /// Directory entries serialized up front.
    Listing { data: Vec<u8>, offset: usize },
}

struct Transaction<H> {
    object: OpenObject<H>,
    name: Option<PathBuf>,
    dest: Option<PathBuf>,
    chunk: ChunkDescriptor,
    md5_requested: bool,
    action: Option<u8>,
    length: Option<u32>,
}

impl<H> Default for Transaction<H> {
    fn default() -> Self {
        Self {
            object: OpenObject::Idle,
            name: None,
            dest: None,
            chunk: ChunkDescriptor::default(),
            md5_requested: false,
            action: None,
            length: None,
        }
    }
}

pub struct FileService<F: FileSystem> {
    fs: F,
    inbox: String,
    tx: Transaction<F::File>,
    scratch: Vec<u8>,
}

impl<F: FileSystem> FileService<F> {
    pub fn new(fs: F, inbox: impl Into<String>) -> Self {
        Self {
            fs,
            inbox: inbox.into(),
            tx: Transaction::default(),
            scratch: vec![0; BUFFER_SIZE],
        }
    }

    /// Route PUT, GET and ACTION_FINAL of `server` to this service.
    pub fn register(server: &mut ObexServer<Self>) -> Result<(), RegisterError> {
        server.register(Opcode::Put, Self::on_put)?;
        server.register(Opcode::PutFinal, Self::on_put)?;
        server.register(Opcode::Get, Self::on_get)?;
        server.register(Opcode::GetFinal, Self::on_get)?;
        server.register(Opcode::ActionFinal, Self::on_action)?;
        Ok(())
    }

    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    /// No object open and no request state pending.
    pub fn is_idle(&self) -> bool {
        matches!(self.tx.object, OpenObject::Idle) && self.tx.name.is_none()
    }

    fn on_put(&mut self, req: &mut Request<'_>) -> Result<Outcome, ObexError> {
        let result = self.put(req);
        if !matches!(result, Ok(Outcome::Continue)) {
            self.reset();
        }
        result
    }

    fn on_get(&mut self, req: &mut Request<'_>) -> Result<Outcome, ObexError> {
        let result = self.get(req);
        if !matches!(result, Ok(Outcome::Continue)) {
            self.reset();
        }
        result
    }

    fn on_action(&mut self, req: &mut Request<'_>) -> Result<Outcome, ObexError> {
        let result = self.action(req);
        self.reset();
        result
    }

    fn put(&mut self, req: &mut Request<'_>) -> Result<Outcome, ObexError> {
        while let Some(header) = req.next_header()? {
            match (HeaderId::from_u8(header.id), &header.value) {
                (Some(HeaderId::Name), HeaderValue::Unicode(units)) => self.set_name(units)?,
                (Some(HeaderId::Body | HeaderId::EndOfBody), HeaderValue::Bytes(data)) => {
                    self.write_body(data)?
                }
                (Some(HeaderId::AppParams), HeaderValue::Bytes(data)) => self.set_chunk(data)?,
                (Some(HeaderId::ConnectId | HeaderId::Length), _) => {
                    debug!("PUT: ignoring header 0x{:02x}", header.id)
                }
                _ => return Err(ObexError::UnsupportedHeader(header.id)),
            }
        }

        if req.opcode != Opcode::PutFinal {
            req.reply(ResponseCode::Continue.fbs())?;
            return Ok(Outcome::Continue);
        }
        if let OpenObject::Writing(_) = self.tx.object {
            if let Some(name) = &self.tx.name {
                info!("stored {}", name.display());
            }
        } else if let Some(name) = &self.tx.name {
            self.fs.remove(name).map_err(ObexError::fs("remove"))?;
            info!("removed {}", name.display());
        } else {
            return Err(ObexError::Rejected("PUT_FINAL without NAME or body"));
        }
        self.reset();
        req.reply(ResponseCode::Ok.fbs())?;
        Ok(Outcome::Done)
    }

    fn get(&mut self, req: &mut Request<'_>) -> Result<Outcome, ObexError> {
        while let Some(header) = req.next_header()? {
            match (HeaderId::from_u8(header.id), &header.value) {
                (Some(HeaderId::Name), HeaderValue::Unicode(units)) => self.set_name(units)?,
                (Some(HeaderId::AppParams), HeaderValue::Bytes(data)) => self.set_chunk(data)?,
                (Some(HeaderId::Type), HeaderValue::Bytes(data)) => self.set_type(data)?,
                (Some(HeaderId::ConnectId), _) => {
                    debug!("GET: ignoring header 0x{:02x}", header.id)
                }
                _ => return Err(ObexError::UnsupportedHeader(header.id)),
            }
        }

        if let OpenObject::Idle = self.tx.object {
            return self.open_for_get(req);
        }
        if self.tx.md5_requested {
            return self.send_digest(req);
        }
        self.send_next_chunk(req)
    }

    fn action(&mut self, req: &mut Request<'_>) -> Result<Outcome, ObexError> {
        while let Some(header) = req.next_header()? {
            match (HeaderId::from_u8(header.id), &header.value) {
                (Some(HeaderId::Name), HeaderValue::Unicode(units)) => self.set_name(units)?,
                (Some(HeaderId::DestName), HeaderValue::Unicode(units)) => {
                    self.set_dest_name(units)?
                }
                (Some(HeaderId::ActionId), HeaderValue::OneByte(id)) => self.tx.action = Some(*id),
                (Some(HeaderId::Length), HeaderValue::FourBytes(len)) => {
                    if i32::try_from(*len).is_err() {
                        return Err(ObexError::Rejected("LENGTH out of range"));
                    }
                    self.tx.length = Some(*len);
                }
                (Some(HeaderId::ConnectId), _) => {
                    debug!("ACTION: ignoring header 0x{:02x}", header.id)
                }
                _ => return Err(ObexError::UnsupportedHeader(header.id)),
            }
        }

        let name = self
            .tx
            .name
            .clone()
            .ok_or(ObexError::Rejected("ACTION without NAME"))?;
        let action = self
            .tx
            .action
            .ok_or(ObexError::Rejected("ACTION without ACTION_ID"))?;
        match ActionId::from_u8(action) {
            Some(ActionId::Resize) => {
                let len = self
                    .tx
                    .length
                    .ok_or(ObexError::Rejected("resize without LENGTH"))?;
                self.resize(&name, u64::from(len))?;
                info!("resized {} to {} bytes", name.display(), len);
            }
            Some(op @ (ActionId::Copy | ActionId::MoveRename)) => {
                let dest = self
                    .tx
                    .dest
                    .clone()
                    .ok_or(ObexError::Rejected("copy/move without DESTNAME"))?;
                if dest == name {
                    return Err(ObexError::Rejected("DESTNAME equals NAME"));
                }
                if op == ActionId::Copy {
                    self.fs.copy(&name, &dest).map_err(ObexError::fs("copy"))?;
                } else {
                    self.fs.rename(&name, &dest).map_err(ObexError::fs("rename"))?;
                }
                info!("{:?} {} -> {}", op, name.display(), dest.display());
            }
            _ => {
                warn!("action 0x{:02x} is not supported", action);
                return Err(ObexError::Unsupported("action"));
            }
        }
        req.reply(ResponseCode::Ok.fbs())?;
        Ok(Outcome::Done)
    }

    fn set_name(&mut self, units: &[u16]) -> Result<(), ObexError> {
        if self.tx.name.is_some() {
            return Err(ObexError::Rejected("NAME given twice"));
        }
        self.tx.name = Some(self.resolve(units)?);
        Ok(())
    }

    fn set_dest_name(&mut self, units: &[u16]) -> Result<(), ObexError> {
        if self.tx.dest.is_some() {
            return Err(ObexError::Rejected("DESTNAME given twice"));
        }
        self.tx.dest = Some(self.resolve(units)?);
        Ok(())
    }

    /// Inbox prefix + decoded name. `units` includes the terminating NUL.
    fn resolve(&self, units: &[u16]) -> Result<PathBuf, ObexError> {
        if self.inbox.len() + units.len() > MAX_FILENAME_LEN {
            return Err(ObexError::Rejected("name too long"));
        }
        let name = decode_unicode(units)?;
        Ok(PathBuf::from(format!("{}{}", self.inbox, name)))
    }

    fn set_chunk(&mut self, data: &[u8]) -> Result<(), ObexError> {
        if self.tx.name.is_none() {
            return Err(ObexError::Rejected("APP_PARAMS before NAME"));
        }
        if !matches!(self.tx.object, OpenObject::Idle) {
            return Err(ObexError::Rejected("APP_PARAMS after object was opened"));
        }
        self.tx.chunk = ChunkDescriptor::parse(data)?;
        Ok(())
    }

    fn set_type(&mut self, data: &[u8]) -> Result<(), ObexError> {
        if !matches!(self.tx.object, OpenObject::Idle) {
            return Err(ObexError::Rejected("TYPE after object was opened"));
        }
        if data != MD5_TYPE {
            return Err(ObexError::Unsupported("TYPE"));
        }
        self.tx.md5_requested = true;
        Ok(())
    }

    fn write_body(&mut self, data: &[u8]) -> Result<(), ObexError> {
        let Some(name) = &self.tx.name else {
            return Err(ObexError::Rejected("BODY before NAME"));
        };
        if let OpenObject::Idle = self.tx.object {
            let mut file = self
                .fs
                .open(name, OpenMode::Write)
                .map_err(ObexError::fs("open for write"))?;
            if self.tx.chunk.start_offset != 0 {
                let size = file.size().map_err(ObexError::fs("size"))?;
                let offset = self.tx.chunk.write_offset(size)?;
                file.seek(SeekFrom::Start(offset))
                    .map_err(ObexError::fs("seek"))?;
            }
            debug!("writing {}", name.display());
            self.tx.object = OpenObject::Writing(file);
        }
        match &mut self.tx.object {
            OpenObject::Writing(file) => file.write_all(data).map_err(ObexError::fs("write")),
            _ => Err(ObexError::Rejected("BODY while another object is open")),
        }
    }

    fn open_for_get(&mut self, req: &mut Request<'_>) -> Result<Outcome, ObexError> {
        let path = self
            .tx
            .name
            .clone()
            .ok_or(ObexError::Rejected("GET without NAME"))?;
        let stat = self.fs.stat(&path).map_err(ObexError::fs("stat"))?;
        let remaining = if stat.kind == ObjectKind::Directory {
            if self.tx.md5_requested {
                return Err(ObexError::Unsupported("digest of a directory"));
            }
            let data = self.list_directory(&path)?;
            let len = data.len() as u64;
            self.tx.object = OpenObject::Listing { data, offset: 0 };
            len
        } else {
            let mut file = self
                .fs
                .open(&path, OpenMode::Read)
                .map_err(ObexError::fs("open for read"))?;
            let size = file.size().map_err(ObexError::fs("size"))?;
            let window = self.tx.chunk.read_window(size)?;
            if window.start != 0 {
                file.seek(SeekFrom::Start(window.start))
                    .map_err(ObexError::fs("seek"))?;
            }
            self.tx.object = OpenObject::Reading {
                file,
                offset: window.start,
                end: window.end,
            };
            window.end - window.start
        };

        let length = if self.tx.md5_requested {
            MD5_DIGEST_LEN as u32
        } else {
            u32::try_from(remaining).map_err(|_| ObexError::Unsupported("object over 4 GiB"))?
        };
        debug!("GET {}: {} bytes", path.display(), length);
        req.reply_with(
            ResponseCode::Continue.fbs(),
            &[Header::four_bytes(HeaderId::Length, length)],
        )?;
        Ok(Outcome::Continue)
    }

    fn list_directory(&self, path: &Path) -> Result<Vec<u8>, ObexError> {
        let mut data = Vec::new();
        for entry in self.fs.read_dir(path).map_err(ObexError::fs("opendir"))? {
            let entry = entry.map_err(ObexError::fs("readdir"))?;
            if data.len() + DIR_RECORD_LEN > BUFFER_SIZE {
                return Err(ObexError::Rejected("directory listing exceeds buffer"));
            }
            entry.encode_record(&mut data);
        }
        Ok(data)
    }

    fn send_digest(&mut self, req: &mut Request<'_>) -> Result<Outcome, ObexError> {
        let OpenObject::Reading { file, offset, end } = &mut self.tx.object else {
            return Err(ObexError::Rejected("no file open for digest"));
        };
        let digest = integrity::md5_stream(file, *end - *offset).map_err(ObexError::fs("read"))?;
        req.reply_with(
            ResponseCode::Ok.fbs(),
            &[Header::bytes(HeaderId::EndOfBody, &digest)],
        )?;
        Ok(Outcome::Done)
    }

    fn send_next_chunk(&mut self, req: &mut Request<'_>) -> Result<Outcome, ObexError> {
        let max = req.max_body_payload();
        let (chunk, last): (&[u8], bool) = match &mut self.tx.object {
            OpenObject::Reading { file, offset, end } => {
                let n = (*end - *offset).min(max as u64) as usize;
                let buf = &mut self.scratch[..n];
                file.read_exact(buf).map_err(ObexError::fs("read"))?;
                *offset += n as u64;
                (&*buf, *offset == *end)
            }
            OpenObject::Listing { data, offset } => {
                let start = *offset;
                let n = (data.len() - start).min(max);
                *offset += n;
                (&data[start..start + n], *offset == data.len())
            }
            _ => return Err(ObexError::Rejected("GET while writing")),
        };
        if last {
            req.reply_with(
                ResponseCode::Ok.fbs(),
                &[Header::bytes(HeaderId::EndOfBody, chunk)],
            )?;
            Ok(Outcome::Done)
        } else {
            req.reply_with(
                ResponseCode::Continue.fbs(),
                &[Header::bytes(HeaderId::Body, chunk)],
            )?;
            Ok(Outcome::Continue)
        }
    }

    fn resize(&self, path: &Path, target: u64) -> Result<(), ObexError> {
        let mut file = self
            .fs
            .open(path, OpenMode::Append)
            .map_err(ObexError::fs("open for append"))?;
        let size = file.size().map_err(ObexError::fs("size"))?;
        if target <= size {
            drop(file);
            return self.fs.truncate(path, target).map_err(ObexError::fs("truncate"));
        }
        let mut left = target - size;
        while left > 0 {
            let n = left.min(BUFFER_SIZE as u64) as usize;
            file.write_all(&ZEROS[..n]).map_err(ObexError::fs("write"))?;
            left -= n as u64;
        }
        Ok(())
    }
}

impl<F: FileSystem> ObexService for FileService<F> {
    fn reset(&mut self) {
        // Dropping the transaction closes any open file.
        drop(mem::take(&mut self.tx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::fs::LocalFileSystem;
    use crate::protocol::OBEX_VERSION;
    use crate::testutil::{request, responses, RawPacket};
    use crate::wire::PacketCodec;
    use rand::Rng;
    use std::fs;
    use std::sync::Arc;

    const OK: u8 = 0xA0;
    const CONT: u8 = 0x90;
    const ISE: u8 = 0xD0;

    struct Harness {
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir(dir.path().join("data")).unwrap();
            Self { dir }
        }

        fn inbox(&self) -> String {
            self.dir.path().to_str().unwrap().to_string()
        }

        fn path(&self, name: &str) -> PathBuf {
            PathBuf::from(format!("{}{}", self.inbox(), name))
        }

        /// Connect with `max_packet`, send `requests`, return the responses after the
        /// CONNECT reply and whether the service ended idle.
        fn exchange_with(&self, max_packet: u16, requests: &[Vec<u8>]) -> (Vec<RawPacket>, bool) {
            let mut input = request(0x80, &[OBEX_VERSION, 0, (max_packet >> 8) as u8, max_packet as u8], &[]);
            for r in requests {
                input.extend_from_slice(r);
            }
            let ch = Arc::new(MemoryChannel::scripted("fs", &input));
            let service = FileService::new(LocalFileSystem, self.inbox());
            let mut server = ObexServer::new(PacketCodec::new(ch.clone()), service);
            FileService::register(&mut server).unwrap();
            for _ in 0..=requests.len() {
                server.process_next().unwrap();
            }
            let mut out = responses(&ch.take_output());
            assert_eq!(out.remove(0).code, OK);
            (out, server.service().is_idle())
        }

        fn exchange(&self, requests: &[Vec<u8>]) -> Vec<RawPacket> {
            self.exchange_with(0xFF00, requests).0
        }
    }

    fn name(n: &str) -> Header<'static> {
        Header::unicode(HeaderId::Name, n)
    }

    fn codes(out: &[RawPacket]) -> Vec<u8> {
        out.iter().map(|p| p.code).collect()
    }

    #[test]
    fn put_creates_file() {
        let h = Harness::new();
        let out = h.exchange(&[request(
            0x82,
            &[],
            &[name("/data/test.bin"), Header::bytes(HeaderId::EndOfBody, b"hello")],
        )]);
        assert_eq!(codes(&out), vec![OK]);
        assert_eq!(fs::read(h.path("/data/test.bin")).unwrap(), b"hello");
    }

    #[test]
    fn put_over_several_packets() {
        let h = Harness::new();
        let (out, idle) = h.exchange_with(
            0xFF00,
            &[
                request(
                    0x02,
                    &[],
                    &[
                        Header::four_bytes(HeaderId::Length, 5),
                        name("/data/a"),
                        Header::bytes(HeaderId::Body, b"hel"),
                    ],
                ),
                request(0x02, &[], &[Header::bytes(HeaderId::Body, b"l")]),
                request(0x82, &[], &[Header::bytes(HeaderId::EndOfBody, b"o")]),
            ],
        );
        assert_eq!(codes(&out), vec![CONT, CONT, OK]);
        assert!(idle);
        assert_eq!(fs::read(h.path("/data/a")).unwrap(), b"hello");
    }

    #[test]
    fn put_at_chunk_offset_overwrites_in_place() {
        let h = Harness::new();
        fs::write(h.path("/data/a"), b"abcdef").unwrap();
        let params = ChunkDescriptor::new(2, 2).encode();
        let out = h.exchange(&[request(
            0x82,
            &[],
            &[
                name("/data/a"),
                Header::bytes(HeaderId::AppParams, &params),
                Header::bytes(HeaderId::EndOfBody, b"XY"),
            ],
        )]);
        assert_eq!(codes(&out), vec![OK]);
        assert_eq!(fs::read(h.path("/data/a")).unwrap(), b"abXYef");
    }

    #[test]
    fn put_offset_past_end_fails_without_writing() {
        let h = Harness::new();
        fs::write(h.path("/data/a"), b"abc").unwrap();
        let params = ChunkDescriptor::new(4, 1).encode();
        let (out, idle) = h.exchange_with(
            0xFF00,
            &[request(
                0x82,
                &[],
                &[
                    name("/data/a"),
                    Header::bytes(HeaderId::AppParams, &params),
                    Header::bytes(HeaderId::EndOfBody, b"Z"),
                ],
            )],
        );
        assert_eq!(codes(&out), vec![ISE]);
        assert!(idle);
        assert_eq!(fs::read(h.path("/data/a")).unwrap(), b"abc");
    }

    #[test]
    fn header_ordering_and_duplicates_are_rejected() {
        let h = Harness::new();
        let params = ChunkDescriptor::new(0, 1).encode();
        let out = h.exchange(&[
            request(0x82, &[], &[Header::bytes(HeaderId::Body, b"x")]),
            request(0x82, &[], &[Header::bytes(HeaderId::AppParams, &params)]),
            request(0x82, &[], &[name("/data/a"), name("/data/b")]),
            request(0x82, &[], &[]),
        ]);
        assert_eq!(codes(&out), vec![ISE, ISE, ISE, ISE]);
        assert!(!h.path("/data/a").exists());
    }

    #[test]
    fn unsupported_headers_abort_put() {
        let h = Harness::new();
        let (out, idle) = h.exchange_with(
            0xFF00,
            &[request(
                0x82,
                &[],
                &[
                    name("/data/a"),
                    Header::unicode(HeaderId::Description, "note"),
                ],
            )],
        );
        assert_eq!(codes(&out), vec![ISE]);
        assert!(idle);
    }

    #[test]
    fn overlong_name_is_rejected() {
        let h = Harness::new();
        let long = format!("/{}", "n".repeat(MAX_FILENAME_LEN));
        let out = h.exchange(&[request(
            0x82,
            &[],
            &[name(&long), Header::bytes(HeaderId::EndOfBody, b"x")],
        )]);
        assert_eq!(codes(&out), vec![ISE]);
    }

    #[test]
    fn get_streams_file() {
        let h = Harness::new();
        fs::write(h.path("/data/test.bin"), b"hello").unwrap();
        let (out, idle) = h.exchange_with(
            0xFF00,
            &[
                request(0x83, &[], &[name("/data/test.bin")]),
                request(0x83, &[], &[]),
            ],
        );
        assert_eq!(codes(&out), vec![CONT, OK]);
        assert_eq!(out[0].header(HeaderId::Length), Some(5u32.to_be_bytes().to_vec()));
        assert_eq!(out[1].header(HeaderId::EndOfBody), Some(b"hello".to_vec()));
        assert!(idle);
    }

    #[test]
    fn get_md5_digest() {
        let h = Harness::new();
        fs::write(h.path("/data/test.bin"), b"hello").unwrap();
        let out = h.exchange(&[
            request(
                0x83,
                &[],
                &[name("/data/test.bin"), Header::bytes(HeaderId::Type, b"md5")],
            ),
            request(0x83, &[], &[]),
        ]);
        assert_eq!(codes(&out), vec![CONT, OK]);
        assert_eq!(out[0].header(HeaderId::Length), Some(16u32.to_be_bytes().to_vec()));
        assert_eq!(
            out[1].header(HeaderId::EndOfBody),
            Some(integrity::md5_digest(b"hello").to_vec())
        );
    }

    #[test]
    fn get_rejects_unknown_type() {
        let h = Harness::new();
        fs::write(h.path("/data/a"), b"x").unwrap();
        let out = h.exchange(&[request(
            0x83,
            &[],
            &[name("/data/a"), Header::bytes(HeaderId::Type, b"sha1")],
        )]);
        assert_eq!(codes(&out), vec![ISE]);
    }

    #[test]
    fn get_missing_file_fails() {
        let h = Harness::new();
        let (out, idle) = h.exchange_with(0xFF00, &[request(0x83, &[], &[name("/data/none")])]);
        assert_eq!(codes(&out), vec![ISE]);
        assert!(idle);
    }

    #[test]
    fn chunked_get_returns_exact_bytes() {
        let h = Harness::new();
        let mut rng = rand::thread_rng();
        for max_packet in [255u16, 1000, 0xFF00] {
            let n: usize = rng.gen_range(1..20_000);
            let data: Vec<u8> = (0..n).map(|_| rng.gen()).collect();
            fs::write(h.path("/data/blob"), &data).unwrap();

            let m = usize::from(max_packet.min(8192)) - 6;
            let packets = n.div_ceil(m);
            let mut requests = vec![request(0x83, &[], &[name("/data/blob")])];
            requests.extend((0..packets).map(|_| request(0x83, &[], &[])));
            let (out, idle) = h.exchange_with(max_packet, &requests);

            assert_eq!(out[0].code, CONT);
            assert_eq!(out[0].header(HeaderId::Length), Some((n as u32).to_be_bytes().to_vec()));
            let chunks = &out[1..];
            assert_eq!(chunks.len(), packets);
            let mut received = Vec::new();
            for (i, p) in chunks.iter().enumerate() {
                let last = i + 1 == packets;
                assert_eq!(p.code, if last { OK } else { CONT });
                let id = if last { HeaderId::EndOfBody } else { HeaderId::Body };
                let body = p.header(id).unwrap();
                assert!(body.len() <= m);
                assert!(p.payload.len() + 3 <= usize::from(max_packet));
                received.extend(body);
            }
            assert_eq!(received, data);
            assert!(idle);
        }
    }

    #[test]
    fn get_chunk_window() {
        let h = Harness::new();
        fs::write(h.path("/data/a"), b"0123456789").unwrap();
        let params = ChunkDescriptor::new(2, 5).encode();
        let out = h.exchange(&[
            request(
                0x83,
                &[],
                &[name("/data/a"), Header::bytes(HeaderId::AppParams, &params)],
            ),
            request(0x83, &[], &[]),
        ]);
        assert_eq!(out[0].header(HeaderId::Length), Some(5u32.to_be_bytes().to_vec()));
        assert_eq!(out[1].header(HeaderId::EndOfBody), Some(b"23456".to_vec()));
    }

    #[test]
    fn get_chunk_out_of_bounds_sends_no_data() {
        let h = Harness::new();
        fs::write(h.path("/data/a"), b"0123456789").unwrap();
        let params = ChunkDescriptor::new(8, 5).encode();
        let out = h.exchange(&[request(
            0x83,
            &[],
            &[name("/data/a"), Header::bytes(HeaderId::AppParams, &params)],
        )]);
        assert_eq!(codes(&out), vec![ISE]);
        assert!(out[0].payload.is_empty());
    }

    #[test]
    fn get_directory_listing() {
        let h = Harness::new();
        fs::write(h.path("/data/a.bin"), b"x").unwrap();
        fs::create_dir(h.path("/data/sub")).unwrap();
        let out = h.exchange(&[
            request(0x83, &[], &[name("/data")]),
            request(0x83, &[], &[]),
        ]);
        assert_eq!(codes(&out), vec![CONT, OK]);
        let expected = (2 * DIR_RECORD_LEN) as u32;
        assert_eq!(out[0].header(HeaderId::Length), Some(expected.to_be_bytes().to_vec()));
        let listing = out[1].header(HeaderId::EndOfBody).unwrap();
        assert_eq!(listing.len(), 2 * DIR_RECORD_LEN);
        let mut names: Vec<Vec<u8>> = listing
            .chunks(DIR_RECORD_LEN)
            .map(|r| {
                let len = u32::from_be_bytes([r[260], r[261], r[262], r[263]]) as usize;
                r[..len].to_vec()
            })
            .collect();
        names.sort();
        assert_eq!(names, vec![b"a.bin".to_vec(), b"sub".to_vec()]);
    }

    #[test]
    fn get_empty_directory() {
        let h = Harness::new();
        let out = h.exchange(&[request(0x83, &[], &[name("/data")]), request(0x83, &[], &[])]);
        assert_eq!(out[0].header(HeaderId::Length), Some(0u32.to_be_bytes().to_vec()));
        assert_eq!(out[1].code, OK);
        assert_eq!(out[1].header(HeaderId::EndOfBody), Some(Vec::new()));
    }

    #[test]
    fn oversized_directory_listing_fails() {
        let h = Harness::new();
        let count = BUFFER_SIZE / DIR_RECORD_LEN + 1;
        for i in 0..count {
            fs::write(h.path(&format!("/data/f{i}")), b"").unwrap();
        }
        let out = h.exchange(&[request(0x83, &[], &[name("/data")])]);
        assert_eq!(codes(&out), vec![ISE]);
    }

    #[test]
    fn md5_of_directory_is_unsupported() {
        let h = Harness::new();
        let out = h.exchange(&[request(
            0x83,
            &[],
            &[name("/data"), Header::bytes(HeaderId::Type, b"md5")],
        )]);
        assert_eq!(codes(&out), vec![ISE]);
    }

    fn action(headers: &[Header<'_>]) -> Vec<u8> {
        request(0x86, &[], headers)
    }

    #[test]
    fn resize_truncates_grows_and_is_idempotent() {
        let h = Harness::new();
        fs::write(h.path("/data/test.bin"), b"hello").unwrap();
        let resize = |len: u32| {
            action(&[
                Header::one_byte(HeaderId::ActionId, ActionId::Resize.code()),
                name("/data/test.bin"),
                Header::four_bytes(HeaderId::Length, len),
            ])
        };
        let out = h.exchange(&[resize(2)]);
        assert_eq!(codes(&out), vec![OK]);
        assert_eq!(fs::read(h.path("/data/test.bin")).unwrap(), b"he");

        let out = h.exchange(&[resize(2)]);
        assert_eq!(codes(&out), vec![OK]);
        assert_eq!(fs::read(h.path("/data/test.bin")).unwrap(), b"he");

        let out = h.exchange(&[resize(20_000)]);
        assert_eq!(codes(&out), vec![OK]);
        let grown = fs::read(h.path("/data/test.bin")).unwrap();
        assert_eq!(grown.len(), 20_000);
        assert_eq!(&grown[..2], b"he");
        assert!(grown[2..].iter().all(|b| *b == 0));
    }

    #[test]
    fn resize_requires_length() {
        let h = Harness::new();
        fs::write(h.path("/data/a"), b"hello").unwrap();
        let (out, idle) = h.exchange_with(
            0xFF00,
            &[action(&[
                name("/data/a"),
                Header::one_byte(HeaderId::ActionId, ActionId::Resize.code()),
            ])],
        );
        assert_eq!(codes(&out), vec![ISE]);
        assert!(idle);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let h = Harness::new();
        fs::write(h.path("/data/a"), b"hello").unwrap();
        let out = h.exchange(&[action(&[
            name("/data/a"),
            Header::one_byte(HeaderId::ActionId, ActionId::Resize.code()),
            Header::four_bytes(HeaderId::Length, 0x8000_0000),
        ])]);
        assert_eq!(codes(&out), vec![ISE]);
        assert_eq!(fs::read(h.path("/data/a")).unwrap(), b"hello");
    }

    #[test]
    fn copy_and_move() {
        let h = Harness::new();
        fs::write(h.path("/data/a"), b"abc").unwrap();
        let out = h.exchange(&[
            action(&[
                name("/data/a"),
                Header::one_byte(HeaderId::ActionId, ActionId::Copy.code()),
                Header::unicode(HeaderId::DestName, "/data/b"),
            ]),
            action(&[
                name("/data/b"),
                Header::one_byte(HeaderId::ActionId, ActionId::MoveRename.code()),
                Header::unicode(HeaderId::DestName, "/data/c"),
            ]),
        ]);
        assert_eq!(codes(&out), vec![OK, OK]);
        assert_eq!(fs::read(h.path("/data/a")).unwrap(), b"abc");
        assert!(!h.path("/data/b").exists());
        assert_eq!(fs::read(h.path("/data/c")).unwrap(), b"abc");
    }

    #[test]
    fn copy_needs_distinct_destination() {
        let h = Harness::new();
        fs::write(h.path("/data/a"), b"abc").unwrap();
        let out = h.exchange(&[
            action(&[
                name("/data/a"),
                Header::one_byte(HeaderId::ActionId, ActionId::Copy.code()),
            ]),
            action(&[
                name("/data/a"),
                Header::one_byte(HeaderId::ActionId, ActionId::Copy.code()),
                Header::unicode(HeaderId::DestName, "/data/a"),
            ]),
        ]);
        assert_eq!(codes(&out), vec![ISE, ISE]);
    }

    #[test]
    fn unknown_and_permission_actions_are_unsupported() {
        let h = Harness::new();
        fs::write(h.path("/data/a"), b"abc").unwrap();
        let out = h.exchange(&[
            action(&[
                name("/data/a"),
                Header::one_byte(HeaderId::ActionId, ActionId::SetPermissions.code()),
            ]),
            action(&[name("/data/a"), Header::one_byte(HeaderId::ActionId, 0x42)]),
            action(&[Header::one_byte(HeaderId::ActionId, ActionId::Resize.code())]),
        ]);
        assert_eq!(codes(&out), vec![ISE, ISE, ISE]);
        assert_eq!(fs::read(h.path("/data/a")).unwrap(), b"abc");
    }

    #[test]
    fn action_headers_in_any_order() {
        let h = Harness::new();
        fs::write(h.path("/data/a"), b"abc").unwrap();
        let out = h.exchange(&[
            action(&[
                Header::unicode(HeaderId::DestName, "/data/b"),
                Header::one_byte(HeaderId::ActionId, ActionId::Copy.code()),
                name("/data/a"),
            ]),
            action(&[
                Header::four_bytes(HeaderId::Length, 1),
                Header::one_byte(HeaderId::ActionId, ActionId::Resize.code()),
                name("/data/b"),
            ]),
        ]);
        assert_eq!(codes(&out), vec![OK, OK]);
        assert_eq!(fs::read(h.path("/data/b")).unwrap(), b"a");
    }

    #[test]
    fn resize_of_missing_file_fails_without_creating_it() {
        let h = Harness::new();
        let (out, idle) = h.exchange_with(
            0xFF00,
            &[action(&[
                name("/data/ghost"),
                Header::one_byte(HeaderId::ActionId, ActionId::Resize.code()),
                Header::four_bytes(HeaderId::Length, 4),
            ])],
        );
        assert_eq!(codes(&out), vec![ISE]);
        assert!(idle);
        assert!(!h.path("/data/ghost").exists());
    }

    #[test]
    fn non_final_action_is_not_served() {
        let h = Harness::new();
        let out = h.exchange(&[request(0x06, &[], &[name("/data/a")])]);
        assert_eq!(codes(&out), vec![ResponseCode::BadRequest.fbs()]);
    }

    #[test]
    fn put_final_without_body_deletes() {
        let h = Harness::new();
        fs::write(h.path("/data/test.bin"), b"hello").unwrap();
        let delete = || request(0x82, &[], &[name("/data/test.bin")]);
        let out = h.exchange(&[delete(), delete()]);
        assert_eq!(codes(&out), vec![OK, ISE]);
        assert!(!h.path("/data/test.bin").exists());
    }

    #[test]
    fn end_to_end_scenario() {
        let h = Harness::new();
        let out = h.exchange(&[
            request(
                0x82,
                &[],
                &[name("/data/test.bin"), Header::bytes(HeaderId::EndOfBody, b"hello")],
            ),
            request(0x83, &[], &[name("/data/test.bin")]),
            request(0x83, &[], &[]),
            request(
                0x83,
                &[],
                &[name("/data/test.bin"), Header::bytes(HeaderId::Type, b"md5")],
            ),
            request(0x83, &[], &[]),
            action(&[
                Header::one_byte(HeaderId::ActionId, ActionId::Resize.code()),
                name("/data/test.bin"),
                Header::four_bytes(HeaderId::Length, 2),
            ]),
            request(0x82, &[], &[name("/data/test.bin")]),
        ]);
        assert_eq!(codes(&out), vec![OK, CONT, OK, CONT, OK, OK, OK]);
        assert_eq!(out[2].header(HeaderId::EndOfBody), Some(b"hello".to_vec()));
        assert!(!h.path("/data/test.bin").exists());
    }
}
