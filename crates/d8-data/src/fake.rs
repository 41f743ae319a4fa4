//! In-process `HttpClient` used by unit tests.

use crate::{HttpClient, HttpResponse, TransferError};
use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::{self, ThreadId};
use std::time::Duration;

#[derive(Clone)]
enum Canned {
    Reply {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct RecordedPut {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedPut {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn offset(&self) -> u64 {
        self.header("X-Offset").unwrap().parse().unwrap()
    }
}

type PutHandler = Box<dyn Fn(&RecordedPut) -> (u16, Vec<(String, String)>) + Send + Sync>;

pub struct FakeClient {
    routes: Mutex<HashMap<(&'static str, String), Canned>>,
    puts: Mutex<Vec<RecordedPut>>,
    put_handler: Mutex<Option<PutHandler>>,
    get_delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    gets: AtomicUsize,
    get_threads: Mutex<HashSet<ThreadId>>,
}

fn owned(headers: &[(&str, &str)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            puts: Mutex::new(Vec::new()),
            put_handler: Mutex::new(None),
            get_delay: None,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            get_threads: Mutex::new(HashSet::new()),
        }
    }

    /// Hold every GET for `delay` so concurrent requests overlap.
    pub fn with_get_delay(mut self, delay: Duration) -> Self {
        self.get_delay = Some(delay);
        self
    }

    pub fn on_get(&self, url: &str, status: u16, body: &[u8]) {
        self.routes.lock().unwrap().insert(
            ("GET", url.to_owned()),
            Canned::Reply {
                status,
                headers: Vec::new(),
                body: body.to_vec(),
            },
        );
    }

    pub fn on_get_error(&self, url: &str, msg: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(("GET", url.to_owned()), Canned::Fail(msg.to_owned()));
    }

    pub fn on_head(&self, url: &str, status: u16, headers: &[(&str, &str)]) {
        self.routes.lock().unwrap().insert(
            ("HEAD", url.to_owned()),
            Canned::Reply {
                status,
                headers: owned(headers),
                body: Vec::new(),
            },
        );
    }

    pub fn on_put(
        &self,
        handler: impl Fn(&RecordedPut) -> (u16, Vec<(String, String)>) + Send + Sync + 'static,
    ) {
        *self.put_handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn puts(&self) -> Vec<RecordedPut> {
        self.puts.lock().unwrap().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of distinct threads that issued a GET.
    pub fn get_thread_count(&self) -> usize {
        self.get_threads.lock().unwrap().len()
    }

    fn reply(&self, method: &'static str, url: &str) -> Result<HttpResponse, TransferError> {
        let canned = self
            .routes
            .lock()
            .unwrap()
            .get(&(method, url.to_owned()))
            .cloned();
        match canned {
            Some(Canned::Reply {
                status,
                headers,
                body,
            }) => Ok(HttpResponse::new(status, headers, Cursor::new(body))),
            Some(Canned::Fail(msg)) => Err(TransferError::Http(msg)),
            None => Ok(HttpResponse::new(
                404,
                Vec::new(),
                Cursor::new(b"not found".to_vec()),
            )),
        }
    }
}

impl HttpClient for FakeClient {
    fn get(&self, url: &str) -> Result<HttpResponse, TransferError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.get_threads
            .lock()
            .unwrap()
            .insert(thread::current().id());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.get_delay {
            thread::sleep(delay);
        }
        let result = self.reply("GET", url);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn head(&self, url: &str) -> Result<HttpResponse, TransferError> {
        self.reply("HEAD", url)
    }

    fn put(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &mut dyn Read,
        len: u64,
    ) -> Result<HttpResponse, TransferError> {
        let mut data = Vec::new();
        body.take(len).read_to_end(&mut data)?;
        let recorded = RecordedPut {
            url: url.to_owned(),
            headers: headers
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.clone()))
                .collect(),
            body: data,
        };
        let (status, reply_headers) = match self.put_handler.lock().unwrap().as_ref() {
            Some(handler) => handler(&recorded),
            None => (200, Vec::new()),
        };
        self.puts.lock().unwrap().push(recorded);
        Ok(HttpResponse::new(status, reply_headers, std::io::empty()))
    }
}
