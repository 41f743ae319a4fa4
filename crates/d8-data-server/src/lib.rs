//! Reference data-plane server for `d8 data`.
//!
//! Serves one directory tree over the `/api/v1/files` routes and, when a block
//! image is configured, its size over `/api/v1/block`. Uploads are written at
//! the offset the client names and answered with the next expected offset, so
//! interrupted uploads can resume.
//!
//! The [`TestServer`] helper starts a server on a random port for integration testing.

use d8_data::{
    BLOCK_API, FILES_API, HEADER_CONTENT_LENGTH, HEADER_GID, HEADER_NEXT_OFFSET, HEADER_OFFSET,
    HEADER_PERMISSIONS, HEADER_UID,
};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

/// A request the volume refused, with the HTTP status to answer.
#[derive(Debug)]
pub struct Rejection {
    pub status: u16,
    pub message: String,
}

impl Rejection {
    fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<io::Error> for Rejection {
    fn from(e: io::Error) -> Self {
        let status = match e.kind() {
            io::ErrorKind::NotFound => 404,
            io::ErrorKind::PermissionDenied => 403,
            _ => 500,
        };
        Self::new(status, e.to_string())
    }
}

/// Metadata carried by one upload chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeaders {
    pub offset: u64,
    pub total: u64,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

#[derive(Serialize)]
struct ListingItem {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct Listing {
    items: Vec<ListingItem>,
}

/// The exported (or importing) volume: a directory plus an optional block image.
pub struct Volume {
    root: PathBuf,
    block_image: Option<PathBuf>,
    writes: Mutex<()>,
}

impl Volume {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            block_image: None,
            writes: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_block_image(mut self, image: PathBuf) -> Self {
        self.block_image = Some(image);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a decoded request path onto the volume. `..` is refused.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf, Rejection> {
        let mut path = self.root.clone();
        for component in Path::new(rel).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(Rejection::new(400, "path escapes the volume root"));
                }
            }
        }
        Ok(path)
    }

    /// JSON listing of the directory at `rel`, entries sorted by name.
    pub fn listing(&self, rel: &str) -> Result<Vec<u8>, Rejection> {
        let dir = self.resolve(rel)?;
        if !dir.is_dir() {
            return Err(Rejection::new(404, format!("{rel}: not a directory")));
        }
        let mut items = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                warn!("skipping non UTF-8 name in {}", dir.display());
                continue;
            };
            let file_type = entry.file_type()?;
            let kind = if file_type.is_dir() {
                "dir"
            } else if file_type.is_file() {
                "file"
            } else {
                "other"
            };
            items.push(ListingItem { name, kind });
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        serde_json::to_vec(&Listing { items }).map_err(|e| Rejection::new(500, e.to_string()))
    }

    pub fn open(&self, rel: &str) -> Result<File, Rejection> {
        let path = self.resolve(rel)?;
        if path.is_dir() {
            return Err(Rejection::new(400, format!("{rel}: is a directory")));
        }
        Ok(File::open(path)?)
    }

    /// Bytes already stored at `rel`.
    pub fn progress(&self, rel: &str) -> Result<u64, Rejection> {
        let path = self.resolve(rel)?;
        let meta = fs::metadata(&path)?;
        if meta.is_dir() {
            return Err(Rejection::new(400, format!("{rel}: is a directory")));
        }
        Ok(meta.len())
    }

    pub fn block_size(&self) -> Result<u64, Rejection> {
        let image = self
            .block_image
            .as_ref()
            .ok_or_else(|| Rejection::new(404, "no block device exported"))?;
        Ok(fs::metadata(image)?.len())
    }

    /// Store one chunk and return the next offset the client should send.
    ///
    /// Offset 0 starts the file over. An offset below the stored size is
    /// acknowledged without writing; one above it is a gap and refused.
    pub fn write_chunk(
        &self,
        rel: &str,
        chunk: ChunkHeaders,
        body: &[u8],
    ) -> Result<u64, Rejection> {
        let path = self.resolve(rel)?;
        if rel.ends_with('/') || path == self.root || path.is_dir() {
            return Err(Rejection::new(409, format!("{rel}: is a directory")));
        }
        let _guard = self.writes.lock().unwrap_or_else(PoisonError::into_inner);

        let current = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if chunk.offset > 0 && chunk.offset < current {
            debug!("{rel}: already holds {current} bytes, skipping chunk at {}", chunk.offset);
            return Ok(current);
        }
        if chunk.offset > current {
            return Err(Rejection::new(
                409,
                format!("offset {} is beyond stored size {current}", chunk.offset),
            ));
        }
        let end = chunk.offset + body.len() as u64;
        if end > chunk.total {
            return Err(Rejection::new(
                400,
                format!("chunk ends at {end}, past declared length {}", chunk.total),
            ));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(chunk.offset == 0)
            .open(&path)?;
        file.seek(SeekFrom::Start(chunk.offset))?;
        file.write_all(body)?;

        if end == chunk.total {
            finish_file(&path, chunk);
            info!("{rel}: upload complete ({end} bytes)");
        }
        Ok(end)
    }
}

fn finish_file(path: &Path, chunk: ChunkHeaders) {
    if let Some(mode) = chunk.mode {
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
            warn!("{}: cannot set mode {mode:04o}: {e}", path.display());
        }
    }
    if chunk.uid.is_some() || chunk.gid.is_some() {
        if let Err(e) = std::os::unix::fs::chown(path, chunk.uid, chunk.gid) {
            debug!("{}: ownership left unchanged: {e}", path.display());
        }
    }
}

/// Percent-decode a request path. `None` for broken escapes or non UTF-8.
pub fn decode_path(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = raw.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("valid header")
}

fn request_header<'r>(req: &'r Request, name: &str) -> Option<&'r str> {
    req.headers()
        .iter()
        .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn respond_err(req: Request, code: u16, msg: &str) {
    let _ = req.respond(Response::from_string(msg).with_status_code(StatusCode(code)));
}

fn respond_rejection(req: Request, rejection: &Rejection) {
    if rejection.status >= 500 {
        error!("{}", rejection.message);
    } else {
        debug!("rejected: {}", rejection.message);
    }
    respond_err(req, rejection.status, &rejection.message);
}

fn parse_chunk_headers(req: &Request) -> Result<ChunkHeaders, Rejection> {
    fn number<T: std::str::FromStr>(req: &Request, name: &str) -> Result<Option<T>, Rejection> {
        request_header(req, name)
            .map(|v| {
                v.trim()
                    .parse()
                    .map_err(|_| Rejection::new(400, format!("invalid {name} header '{v}'")))
            })
            .transpose()
    }
    let offset = number(req, HEADER_OFFSET)?
        .ok_or_else(|| Rejection::new(400, format!("missing {HEADER_OFFSET} header")))?;
    let total = number(req, HEADER_CONTENT_LENGTH)?
        .ok_or_else(|| Rejection::new(400, format!("missing {HEADER_CONTENT_LENGTH} header")))?;
    let mode = request_header(req, HEADER_PERMISSIONS)
        .map(|v| {
            u32::from_str_radix(v.trim(), 8)
                .map_err(|_| Rejection::new(400, format!("invalid {HEADER_PERMISSIONS} '{v}'")))
        })
        .transpose()?;
    Ok(ChunkHeaders {
        offset,
        total,
        mode,
        uid: number(req, HEADER_UID)?,
        gid: number(req, HEADER_GID)?,
    })
}

fn handle_files(volume: &Volume, mut req: Request, method: &Method, rel: &str) {
    match *method {
        Method::Get if rel.is_empty() || rel.ends_with('/') => match volume.listing(rel) {
            Ok(json) => {
                let _ = req.respond(
                    Response::from_data(json).with_header(header("Content-Type", "application/json")),
                );
            }
            Err(r) => respond_rejection(req, &r),
        },
        Method::Get => match volume.open(rel) {
            Ok(file) => {
                let _ = req.respond(
                    Response::from_file(file)
                        .with_header(header("Content-Type", "application/octet-stream")),
                );
            }
            Err(r) => respond_rejection(req, &r),
        },
        Method::Head => match volume.progress(rel) {
            Ok(size) => {
                let _ = req.respond(
                    Response::empty(200).with_header(header(HEADER_NEXT_OFFSET, &size.to_string())),
                );
            }
            Err(r) => respond_rejection(req, &r),
        },
        Method::Put => {
            let chunk = match parse_chunk_headers(&req) {
                Ok(chunk) => chunk,
                Err(r) => return respond_rejection(req, &r),
            };
            let mut body = Vec::new();
            if let Err(e) = req.as_reader().read_to_end(&mut body) {
                return respond_err(req, 500, &format!("read error: {e}"));
            }
            match volume.write_chunk(rel, chunk, &body) {
                Ok(next) => {
                    debug!("PUT {rel} at {}: {} bytes, next {next}", chunk.offset, body.len());
                    let _ = req.respond(
                        Response::empty(200)
                            .with_header(header(HEADER_NEXT_OFFSET, &next.to_string())),
                    );
                }
                Err(r) => respond_rejection(req, &r),
            }
        }
        _ => respond_err(req, 405, "method not allowed"),
    }
}

/// Handle a single HTTP request, dispatching to the appropriate route handler.
pub fn handle_request(volume: &Volume, req: Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    let path = url.split('?').next().unwrap_or_default();
    if path == BLOCK_API {
        if method != Method::Head {
            return respond_err(req, 405, "method not allowed");
        }
        match volume.block_size() {
            // tiny_http takes Content-Length from the header and skips the body for HEAD.
            Ok(size) => {
                let _ = req.respond(
                    Response::empty(200).with_header(header("Content-Length", &size.to_string())),
                );
            }
            Err(r) => respond_rejection(req, &r),
        }
    } else if let Some(rest) = path
        .strip_prefix(FILES_API)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
    {
        match decode_path(rest) {
            Some(rel) => handle_files(volume, req, &method, &rel),
            None => respond_err(req, 400, "malformed path encoding"),
        }
    } else if path == "/health" && method == Method::Get {
        let _ = req.respond(Response::from_string(r#"{"status":"ok"}"#));
    } else {
        respond_err(req, 404, "not found");
    }
}

/// Start the server loop, blocking the current thread.
pub fn run_server(volume: &Arc<Volume>, addr: &str) -> io::Result<()> {
    let server = Server::http(addr).map_err(io::Error::other)?;
    for request in server.incoming_requests() {
        handle_request(volume, request);
    }
    Ok(())
}

/// A test helper that starts a data-plane server on a random port in a background thread.
///
/// The server listens on `127.0.0.1:{port}` and serves `root`. Dropping the
/// `TestServer` unblocks the accept loop and joins the thread.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub root: PathBuf,
    server: Arc<Server>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    pub fn start(root: PathBuf) -> Self {
        Self::spawn(Volume::new(root))
    }

    pub fn start_with_block_image(root: PathBuf, image: PathBuf) -> Self {
        Self::spawn(Volume::new(root).with_block_image(image))
    }

    fn spawn(volume: Volume) -> Self {
        fs::create_dir_all(volume.root()).expect("failed to create test volume root");
        let root = volume.root().to_path_buf();
        let server =
            Arc::new(Server::http("127.0.0.1:0").expect("failed to bind test HTTP server"));
        let port = server.server_addr().to_ip().expect("not an IP addr").port();
        let url = format!("http://127.0.0.1:{port}");

        let srv = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&volume, request);
            }
        });

        Self {
            url,
            port,
            root,
            server,
            handle: Some(handle),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
