#![allow(dead_code)]

use std::io::{Read, Write};
use std::mem::size_of;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pdbfetch::pe::{
    CodeviewEntry, ImageDataDirectory, ImageDebugDirectory, ImageSectionHeader, MZHeader,
    PEHeader, WindowsPEHeader32, WindowsPEHeader64, IMAGE_DEBUG_TYPE_CODEVIEW,
    IMAGE_NT_OPTIONAL_HDR32_MAGIC, IMAGE_NT_OPTIONAL_HDR64_MAGIC,
};
use zerocopy::{AsBytes, FromZeroes};

pub const D3D11_SIGNATURE: &str = "4B57CB6785D3D4454CE287EAA21B3C6C1";

const SECTION_VADDR: u32 = 0x1000;
const SECTION_FILE_OFFSET: usize = 0x200;
const NUM_DATA_DIRS: u32 = 16;

/// Assembles a minimal PE image: headers, a single `.rdata` section holding
/// the debug directory, and the CodeView payload at the very end of the file.
#[derive(Clone)]
pub struct ImageBuilder {
    pub pe64: bool,
    pub optional_magic: Option<u16>,
    pub cv_magic: [u8; 4],
    pub guid: [u8; 16],
    pub age: u32,
    pub pdb_path: Vec<u8>,
    pub nul_terminate: bool,
    /// Debug entry types placed ahead of the CodeView one.
    pub leading_entries: Vec<u32>,
    pub include_codeview: bool,
    /// Address the payload by RVA only (`pointer_to_raw_data` of zero).
    pub rva_only: bool,
    pub num_data_dirs: u32,
    pub debug_dir_size: Option<u32>,
    pub debug_dir_rva: Option<u32>,
}

impl ImageBuilder {
    /// The identity of `d3d11.dll` as published by the public symbol server.
    pub fn d3d11() -> Self {
        Self {
            pe64: true,
            optional_magic: None,
            cv_magic: *b"RSDS",
            // 4B57CB67-85D3-D445-4CE2-87EAA21B3C6C in its on-disk form
            guid: [
                0x67, 0xCB, 0x57, 0x4B, 0xD3, 0x85, 0x45, 0xD4, 0x4C, 0xE2, 0x87, 0xEA, 0xA2,
                0x1B, 0x3C, 0x6C,
            ],
            age: 1,
            pdb_path: b"d3d11.pdb".to_vec(),
            nul_terminate: true,
            leading_entries: Vec::new(),
            include_codeview: true,
            rva_only: false,
            num_data_dirs: NUM_DATA_DIRS,
            debug_dir_size: None,
            debug_dir_rva: None,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let iddlen = size_of::<ImageDebugDirectory>();
        let num_entries = self.leading_entries.len() + usize::from(self.include_codeview);
        let cv_rel = num_entries * iddlen;

        let mut payload = Vec::new();
        {
            let mut cv = CodeviewEntry::new_zeroed();
            cv.signature = self.cv_magic;
            cv.as_bytes_mut()[4..20].copy_from_slice(&self.guid);
            cv.age = self.age;
            payload.extend_from_slice(cv.as_bytes());
            payload.extend_from_slice(&self.pdb_path);
            if self.nul_terminate {
                payload.push(0);
            }
        }

        /* Section contents: the debug directory followed by the payload */
        let mut section = Vec::new();
        for &typ in &self.leading_entries {
            let mut de = ImageDebugDirectory::new_zeroed();
            de.typ = typ;
            section.extend_from_slice(de.as_bytes());
        }
        if self.include_codeview {
            let mut de = ImageDebugDirectory::new_zeroed();
            de.typ = IMAGE_DEBUG_TYPE_CODEVIEW;
            de.size_of_data = payload.len() as u32;
            de.address_of_raw_data = SECTION_VADDR + cv_rel as u32;
            de.pointer_to_raw_data = if self.rva_only {
                0
            } else {
                (SECTION_FILE_OFFSET + cv_rel) as u32
            };
            section.extend_from_slice(de.as_bytes());
            section.extend_from_slice(&payload);
        }

        let opt_fixed = if self.pe64 {
            size_of::<WindowsPEHeader64>()
        } else {
            size_of::<WindowsPEHeader32>()
        };
        let opt_size = opt_fixed + self.num_data_dirs as usize * size_of::<ImageDataDirectory>();

        let mut image = Vec::new();

        let mut mz = MZHeader::new_zeroed();
        mz.signature = *b"MZ";
        mz.new_header = size_of::<MZHeader>() as u32;
        image.extend_from_slice(mz.as_bytes());

        let mut pe = PEHeader::new_zeroed();
        pe.signature = *b"PE\0\0";
        pe.machine = if self.pe64 { 0x8664 } else { 0x014c };
        pe.num_sections = 1;
        pe.optional_header_size = opt_size as u16;
        image.extend_from_slice(pe.as_bytes());

        if self.pe64 {
            let mut opt = WindowsPEHeader64::new_zeroed();
            opt.magic = self.optional_magic.unwrap_or(IMAGE_NT_OPTIONAL_HDR64_MAGIC);
            opt.num_tables = self.num_data_dirs;
            image.extend_from_slice(opt.as_bytes());
        } else {
            let mut opt = WindowsPEHeader32::new_zeroed();
            opt.magic = self.optional_magic.unwrap_or(IMAGE_NT_OPTIONAL_HDR32_MAGIC);
            opt.num_tables = self.num_data_dirs;
            image.extend_from_slice(opt.as_bytes());
        }

        for i in 0..self.num_data_dirs {
            let mut dir = ImageDataDirectory::new_zeroed();
            if i == 6 {
                dir.vaddr = self.debug_dir_rva.unwrap_or(SECTION_VADDR);
                dir.size = self
                    .debug_dir_size
                    .unwrap_or((num_entries * iddlen) as u32);
            }
            image.extend_from_slice(dir.as_bytes());
        }

        let mut sec = ImageSectionHeader::new_zeroed();
        sec.name = *b".rdata\0\0";
        sec.vsize = section.len() as u32;
        sec.vaddr = SECTION_VADDR;
        sec.raw_data_size = section.len() as u32;
        sec.pointer_to_raw_data = SECTION_FILE_OFFSET as u32;
        image.extend_from_slice(sec.as_bytes());

        assert!(image.len() <= SECTION_FILE_OFFSET);
        image.resize(SECTION_FILE_OFFSET, 0);
        image.extend_from_slice(&section);

        image
    }
}

/// A canned reply for [`StubServer`].
#[derive(Clone, Debug)]
pub enum Reply {
    Status(u16, Vec<u8>),
    /// Accept the request but never answer it.
    Hang(Duration),
}

/// A loopback HTTP server answering each incoming connection with the next
/// canned reply, recording the request paths it saw.
pub struct StubServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
    handle: Option<JoinHandle<()>>,
}

impl StubServer {
    pub fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}/symbols", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));

        let seen = requests.clone();
        let handle = thread::spawn(move || {
            for reply in replies {
                let (mut stream, _) = match listener.accept() {
                    Ok(conn) => conn,
                    Err(_) => return,
                };

                if let Some(path) = read_request_path(&mut stream) {
                    seen.lock().unwrap().push(path);
                }

                match reply {
                    Reply::Status(code, body) => {
                        let head = format!(
                            "HTTP/1.1 {code} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            reason(code),
                            body.len()
                        );
                        let _ = stream.write_all(head.as_bytes());
                        let _ = stream.write_all(&body);
                        let _ = stream.flush();
                    }
                    Reply::Hang(d) => thread::sleep(d),
                }
            }
        });

        Self {
            base_url,
            requests,
            handle: Some(handle),
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Wait for every canned reply to be served.
    pub fn join(mut self) -> Vec<String> {
        if let Some(h) = self.handle.take() {
            h.join().unwrap();
        }
        self.requests()
    }
}

fn read_request_path(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let text = String::from_utf8_lossy(&buf);
    let request_line = text.lines().next()?;
    request_line.split(' ').nth(1).map(str::to_string)
}

fn reason(code: u16) -> &'static str {
    match code {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// A loopback address with nothing listening on it.
pub fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    format!("http://{addr}/symbols")
}
