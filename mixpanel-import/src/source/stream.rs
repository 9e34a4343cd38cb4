use bytes::{Buf, BytesMut};
use reqwest::{Client, Response};
use tracing::{debug, warn};

use crate::error::ImportError;

const NEWLINE_DELIM: u8 = b'\n';

// Bytes pulled from the response body that haven't been handed out as lines yet
struct LineCursor {
    buffer: BytesMut,
    // Bytes at the front of `buffer` already known to hold no newline
    scanned: usize,
    peeked: Option<String>,
    body_finished: bool,
}

impl LineCursor {
    fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            peeked: None,
            body_finished: false,
        }
    }

    // Note that we only decode complete lines, since a chunk boundary can land in the middle of
    // a multi-byte utf8 character
    fn take_complete_line(&mut self) -> Option<String> {
        let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|b| *b == NEWLINE_DELIM)
        else {
            self.scanned = self.buffer.len();
            return None;
        };

        let line = self.buffer.split_to(self.scanned + offset);
        self.buffer.advance(1);
        self.scanned = 0;
        Some(decode_line(&line))
    }

    // Whatever is left once the body is done is the last line, if it's not empty
    fn take_remainder(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = self.buffer.split();
        self.scanned = 0;
        Some(decode_line(&line))
    }

    fn unread_bytes(&self) -> usize {
        self.buffer.len() + self.peeked.as_ref().map_or(0, String::len)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// A single pass, forward only view over the lines of one export response.
///
/// The stream owns the line cursor, the response and the client that made the request.
/// All three are released by [`EventStream::close`], which is also run on drop, so an
/// early return or a `?` in the middle of iteration still frees the connection.
pub struct EventStream {
    cursor: Option<LineCursor>,
    response: Option<Response>,
    client: Option<Client>,
    lines_read: usize,
}

impl EventStream {
    pub fn new(client: Client, response: Response) -> Self {
        Self {
            cursor: Some(LineCursor::new()),
            response: Some(response),
            client: Some(client),
            lines_read: 0,
        }
    }

    pub fn lines_read(&self) -> usize {
        self.lines_read
    }

    pub fn is_closed(&self) -> bool {
        self.cursor.is_none() && self.response.is_none() && self.client.is_none()
    }

    pub async fn has_next(&mut self) -> Result<bool, ImportError> {
        loop {
            let Some(cursor) = self.cursor.as_mut() else {
                return Ok(false);
            };

            if cursor.peeked.is_some() {
                return Ok(true);
            }

            if let Some(line) = cursor.take_complete_line() {
                cursor.peeked = Some(line);
                return Ok(true);
            }

            if cursor.body_finished {
                cursor.peeked = cursor.take_remainder();
                return Ok(cursor.peeked.is_some());
            }

            let Some(response) = self.response.as_mut() else {
                cursor.body_finished = true;
                continue;
            };

            match response.chunk().await {
                Ok(Some(chunk)) => cursor.buffer.extend_from_slice(&chunk),
                Ok(None) => cursor.body_finished = true,
                Err(source) => {
                    self.close();
                    return Err(ImportError::Transport {
                        context: "Failed to read raw events".to_string(),
                        source,
                    });
                }
            }
        }
    }

    pub async fn next_line(&mut self) -> Result<String, ImportError> {
        if !self.has_next().await? {
            return Err(ImportError::StreamExhausted);
        }

        let line = self
            .cursor
            .as_mut()
            .and_then(|cursor| cursor.peeked.take())
            .ok_or(ImportError::StreamExhausted)?;
        self.lines_read += 1;
        Ok(line)
    }

    /// Releases the cursor, the response and the client, in that order. Safe to call
    /// more than once.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }

        if let Some(cursor) = self.cursor.take() {
            let unread = cursor.unread_bytes();
            if unread > 0 || !cursor.body_finished {
                warn!(
                    "Closing event stream early after {} lines, {} bytes unread",
                    self.lines_read, unread
                );
            }
            drop(cursor);
        }

        // Dropping a response that hasn't been read to the end makes reqwest discard the
        // connection instead of returning it to the pool
        if let Some(response) = self.response.take() {
            drop(response);
        }

        if let Some(client) = self.client.take() {
            drop(client);
        }

        debug!("Closed event stream after {} lines", self.lines_read);
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("lines_read", &self.lines_read)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.close();
    }
}
