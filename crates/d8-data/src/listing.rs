//! Incremental decoder for directory listings.
//!
//! The data plane answers `GET …/dir/` with `{"items":[{"name":…,"type":…},…]}`.
//! Listings can be large, so the body is tokenized as it arrives and only one
//! entry is held in memory at a time. Other top-level keys are skipped.

use crate::TransferError;
use serde::Deserialize;
use std::io::{BufRead, BufReader, Read};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

impl DirEntry {
    fn validate(&self) -> Result<(), TransferError> {
        if self.name.is_empty()
            || self.name == "."
            || self.name == ".."
            || self.name.contains(['/', '\0'])
        {
            return Err(TransferError::Protocol(format!(
                "invalid entry name {:?} in directory listing",
                self.name
            )));
        }
        Ok(())
    }
}

/// Where the decoder is in the listing document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingState {
    /// Inside the top-level object, looking for the `items` key.
    SeekingItemsKey,
    /// Between elements of the `items` array.
    InArray,
    /// The array closed, or decoding failed.
    Done,
}

fn truncated() -> TransferError {
    TransferError::Protocol("unexpected end of directory listing".to_owned())
}

fn malformed(what: &str, found: Option<u8>) -> TransferError {
    let found = match found {
        Some(b) => format!("'{}'", char::from(b).escape_default()),
        None => "end of input".to_owned(),
    };
    TransferError::Protocol(format!(
        "malformed directory listing: expected {what}, found {found}"
    ))
}

struct Bytes<R> {
    inner: BufReader<R>,
}

impl<R: Read> Bytes<R> {
    fn peek(&mut self) -> Result<Option<u8>, TransferError> {
        Ok(self.inner.fill_buf()?.first().copied())
    }

    fn next(&mut self) -> Result<Option<u8>, TransferError> {
        let b = self.peek()?;
        if b.is_some() {
            self.inner.consume(1);
        }
        Ok(b)
    }

    fn skip_ws(&mut self) -> Result<Option<u8>, TransferError> {
        loop {
            match self.peek()? {
                Some(b) if b.is_ascii_whitespace() => self.inner.consume(1),
                other => return Ok(other),
            }
        }
    }

    fn expect(&mut self, want: u8, what: &str) -> Result<(), TransferError> {
        match self.skip_ws()? {
            Some(b) if b == want => {
                self.inner.consume(1);
                Ok(())
            }
            other => Err(malformed(what, other)),
        }
    }

    /// Copy one quoted string, escapes untouched, into `out`.
    fn raw_string(&mut self, out: &mut Vec<u8>) -> Result<(), TransferError> {
        match self.next()? {
            Some(b'"') => out.push(b'"'),
            other => return Err(malformed("string", other)),
        }
        loop {
            let b = self.next()?.ok_or_else(truncated)?;
            out.push(b);
            match b {
                b'\\' => out.push(self.next()?.ok_or_else(truncated)?),
                b'"' => return Ok(()),
                _ => {}
            }
        }
    }

    fn string(&mut self) -> Result<String, TransferError> {
        let mut raw = Vec::new();
        self.raw_string(&mut raw)?;
        serde_json::from_slice(&raw)
            .map_err(|e| TransferError::Protocol(format!("bad string in directory listing: {e}")))
    }

    /// Consume one JSON value, copying its bytes into `out` when given.
    fn value(&mut self, out: Option<&mut Vec<u8>>) -> Result<(), TransferError> {
        let capture = out.is_some();
        let mut scratch = Vec::new();
        let buf = match out {
            Some(buf) => buf,
            None => &mut scratch,
        };
        match self.skip_ws()? {
            None => Err(truncated()),
            Some(b'"') => self.raw_string(buf),
            Some(b'{' | b'[') => {
                let mut depth = 0usize;
                loop {
                    match self.peek()?.ok_or_else(truncated)? {
                        b'"' => self.raw_string(buf)?,
                        b => {
                            self.inner.consume(1);
                            buf.push(b);
                            match b {
                                b'{' | b'[' => depth += 1,
                                b'}' | b']' => {
                                    depth -= 1;
                                    if depth == 0 {
                                        return Ok(());
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                    if !capture {
                        buf.clear();
                    }
                }
            }
            Some(_) => {
                while let Some(b) = self.peek()? {
                    if matches!(b, b',' | b'}' | b']') || b.is_ascii_whitespace() {
                        break;
                    }
                    self.inner.consume(1);
                    buf.push(b);
                }
                Ok(())
            }
        }
    }
}

/// Iterator over the entries of one streamed listing.
pub struct ListingDecoder<R> {
    bytes: Bytes<R>,
    state: ListingState,
    first: bool,
}

impl<R: Read> ListingDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            bytes: Bytes {
                inner: BufReader::new(reader),
            },
            state: ListingState::SeekingItemsKey,
            first: true,
        }
    }

    pub fn state(&self) -> ListingState {
        self.state
    }

    /// Consume the top-level object up to and including the `[` of `items`.
    fn seek_items(&mut self) -> Result<(), TransferError> {
        self.bytes.expect(b'{', "'{'")?;
        if self.bytes.skip_ws()? == Some(b'}') {
            return Err(TransferError::Protocol(
                "directory listing has no items array".to_owned(),
            ));
        }
        loop {
            let key = self.bytes.string()?;
            self.bytes.expect(b':', "':'")?;
            if key == "items" {
                return self.bytes.expect(b'[', "'[' after \"items\"");
            }
            self.bytes.value(None)?;
            match self.bytes.skip_ws()? {
                Some(b',') => {
                    self.bytes.inner.consume(1);
                    self.bytes.skip_ws()?;
                }
                Some(b'}') => {
                    return Err(TransferError::Protocol(
                        "directory listing has no items array".to_owned(),
                    ))
                }
                other => return Err(malformed("',' or '}'", other)),
            }
        }
    }

    /// Read the next array element, or close the array.
    fn next_in_array(&mut self) -> Result<Option<DirEntry>, TransferError> {
        let b = self.bytes.skip_ws()?;
        if self.first {
            if b == Some(b']') {
                self.bytes.inner.consume(1);
                self.state = ListingState::Done;
                return Ok(None);
            }
        } else {
            match b {
                Some(b',') => self.bytes.inner.consume(1),
                Some(b']') => {
                    self.bytes.inner.consume(1);
                    self.state = ListingState::Done;
                    return Ok(None);
                }
                other => return Err(malformed("',' or ']'", other)),
            }
        }
        self.first = false;

        match self.bytes.skip_ws()? {
            Some(b'{') => {}
            other => return Err(malformed("entry object", other)),
        }
        let mut raw = Vec::new();
        self.bytes.value(Some(&mut raw))?;
        let entry: DirEntry = serde_json::from_slice(&raw)
            .map_err(|e| TransferError::Protocol(format!("bad directory entry: {e}")))?;
        entry.validate()?;
        Ok(Some(entry))
    }

    fn advance(&mut self) -> Result<Option<DirEntry>, TransferError> {
        loop {
            match self.state {
                ListingState::SeekingItemsKey => {
                    self.seek_items()?;
                    self.state = ListingState::InArray;
                    self.first = true;
                }
                ListingState::InArray => return self.next_in_array(),
                ListingState::Done => return Ok(None),
            }
        }
    }
}

impl<R: Read> Iterator for ListingDecoder<R> {
    type Item = Result<DirEntry, TransferError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.state = ListingState::Done;
                Some(Err(e))
            }
        }
    }
}
