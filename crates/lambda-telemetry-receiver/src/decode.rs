//! Incremental decoding of pushed JSON array batches.
//!
//! The platform pushes each batch as one JSON array. [`ArrayScanner`] splits
//! the body into raw elements chunk by chunk, so only the element currently
//! being assembled is buffered, never the whole array. [`decode_batch`] turns
//! each element into an event and sends it on the processing channel.

use crate::error::DecodeError;
use lambda_extensions_api::BoxError;
use std::mem;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

/// Decodes one raw array element into an event.
pub type DecodeFn<E> = fn(&[u8]) -> Result<E, DecodeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Before the opening `[`.
    ExpectOpen,
    /// After `[`: an element or `]`.
    ExpectFirst,
    /// After `,`: an element.
    ExpectElement,
    /// Inside an object, array or string element.
    InElement {
        depth: usize,
        in_string: bool,
        escape: bool,
    },
    /// Inside a number or literal element.
    InScalar,
    /// After an element: `,` or `]`.
    AfterElement,
    /// After the closing `]`.
    Closed,
}

/// Splits a JSON array into its raw elements as bytes arrive.
///
/// The scanner only tracks nesting and string boundaries. Element contents
/// are validated by whoever parses the returned bytes.
#[derive(Debug)]
pub struct ArrayScanner {
    state: ScanState,
    pending: Vec<u8>,
}

impl Default for ArrayScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ArrayScanner {
    /// Creates a scanner waiting for the opening `[`.
    pub fn new() -> Self {
        Self {
            state: ScanState::ExpectOpen,
            pending: Vec::new(),
        }
    }

    /// Feeds `chunk`, appending every element it completes to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::MalformedArray`] at the first byte that cannot
    /// belong to a JSON array. Elements completed before that byte are still
    /// appended to `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<Vec<u8>>) -> Result<(), DecodeError> {
        for &byte in chunk {
            self.push_byte(byte, out)?;
        }
        Ok(())
    }

    /// Signals the end of the body.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::MalformedArray`] unless the closing `]` was
    /// seen.
    pub fn finish(&self) -> Result<(), DecodeError> {
        match self.state {
            ScanState::Closed => Ok(()),
            ScanState::ExpectOpen => Err(malformed("want [, got end of body")),
            _ => Err(malformed("want ], got end of body")),
        }
    }

    /// Returns `true` once the closing `]` was seen.
    pub fn is_closed(&self) -> bool {
        self.state == ScanState::Closed
    }

    fn push_byte(&mut self, byte: u8, out: &mut Vec<Vec<u8>>) -> Result<(), DecodeError> {
        match self.state {
            ScanState::ExpectOpen => match byte {
                b'[' => self.state = ScanState::ExpectFirst,
                b if is_whitespace(b) => {}
                b => return Err(unexpected("[", b)),
            },
            ScanState::ExpectFirst => match byte {
                b']' => self.state = ScanState::Closed,
                b if is_whitespace(b) => {}
                b => self.start_element(b)?,
            },
            ScanState::ExpectElement => match byte {
                b if is_whitespace(b) => {}
                b => self.start_element(b)?,
            },
            ScanState::InElement {
                depth,
                in_string,
                escape,
            } => {
                self.pending.push(byte);
                self.state = match (in_string, escape, byte) {
                    (true, true, _) => ScanState::InElement {
                        depth,
                        in_string: true,
                        escape: false,
                    },
                    (true, false, b'\\') => ScanState::InElement {
                        depth,
                        in_string: true,
                        escape: true,
                    },
                    (true, false, b'"') if depth == 0 => self.complete(out),
                    (true, false, b'"') => ScanState::InElement {
                        depth,
                        in_string: false,
                        escape: false,
                    },
                    (true, false, _) => self.state,
                    (false, _, b'"') => ScanState::InElement {
                        depth,
                        in_string: true,
                        escape: false,
                    },
                    (false, _, b'{' | b'[') => ScanState::InElement {
                        depth: depth + 1,
                        in_string: false,
                        escape: false,
                    },
                    (false, _, b'}' | b']') if depth == 1 => self.complete(out),
                    (false, _, b'}' | b']') => ScanState::InElement {
                        depth: depth - 1,
                        in_string: false,
                        escape: false,
                    },
                    (false, _, _) => self.state,
                };
            }
            ScanState::InScalar => {
                if is_whitespace(byte) || byte == b',' || byte == b']' {
                    self.state = self.complete(out);
                    return self.push_byte(byte, out);
                }
                self.pending.push(byte);
            }
            ScanState::AfterElement => match byte {
                b',' => self.state = ScanState::ExpectElement,
                b']' => self.state = ScanState::Closed,
                b if is_whitespace(b) => {}
                b => return Err(unexpected(", or ]", b)),
            },
            // Anything after the array is drained with the rest of the body.
            ScanState::Closed => {}
        }
        Ok(())
    }

    fn start_element(&mut self, byte: u8) -> Result<(), DecodeError> {
        self.pending.push(byte);
        self.state = match byte {
            b'{' | b'[' => ScanState::InElement {
                depth: 1,
                in_string: false,
                escape: false,
            },
            b'"' => ScanState::InElement {
                depth: 0,
                in_string: true,
                escape: false,
            },
            b']' | b',' | b'}' | b':' => {
                self.pending.clear();
                return Err(unexpected("array element", byte));
            }
            _ => ScanState::InScalar,
        };
        Ok(())
    }

    fn complete(&mut self, out: &mut Vec<Vec<u8>>) -> ScanState {
        out.push(mem::take(&mut self.pending));
        ScanState::AfterElement
    }
}

fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\r')
}

fn malformed(msg: &str) -> DecodeError {
    DecodeError::MalformedArray(msg.to_string())
}

fn unexpected(want: &str, got: u8) -> DecodeError {
    DecodeError::MalformedArray(format!("want {want}, got {:?}", char::from(got)))
}

/// Decodes a JSON array body into events and sends them on `events`, in
/// array order.
///
/// Cancellation is checked before every element is sent; an element decoded
/// after `cancel` fires is dropped. Elements sent before a failure stay sent.
/// Whatever is left of `body` after the closing `]` or a failure is drained
/// before returning, unless the decode was interrupted.
///
/// Returns the number of events sent.
///
/// # Errors
///
/// Returns [`DecodeError::Interrupted`] if `cancel` fires, or the first
/// element, array or body error.
pub async fn decode_batch<S, B, BE, E>(
    cancel: &CancellationToken,
    mut body: S,
    decode: DecodeFn<E>,
    events: &mpsc::Sender<E>,
) -> Result<usize, DecodeError>
where
    S: Stream<Item = Result<B, BE>> + Unpin,
    B: AsRef<[u8]>,
    BE: Into<BoxError>,
{
    let result = decode_elements(cancel, &mut body, decode, events).await;

    if !matches!(result, Err(DecodeError::Interrupted)) {
        drain(cancel, &mut body).await;
    }

    result
}

async fn decode_elements<S, B, BE, E>(
    cancel: &CancellationToken,
    body: &mut S,
    decode: DecodeFn<E>,
    events: &mpsc::Sender<E>,
) -> Result<usize, DecodeError>
where
    S: Stream<Item = Result<B, BE>> + Unpin,
    B: AsRef<[u8]>,
    BE: Into<BoxError>,
{
    let mut scanner = ArrayScanner::new();
    let mut elements = Vec::new();
    let mut sent = 0;

    loop {
        let chunk = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DecodeError::Interrupted),
            chunk = body.next() => chunk,
        };

        let Some(chunk) = chunk else {
            break;
        };
        let chunk = chunk.map_err(|e| DecodeError::Body(e.into()))?;

        let scanned = scanner.push(chunk.as_ref(), &mut elements);

        for raw in elements.drain(..) {
            let event = decode(&raw)?;

            if cancel.is_cancelled() {
                return Err(DecodeError::Interrupted);
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DecodeError::Interrupted),
                sent_result = events.send(event) => {
                    sent_result.map_err(|_| DecodeError::ChannelClosed)?;
                }
            }
            sent += 1;
        }

        scanned?;

        if scanner.is_closed() {
            break;
        }
    }

    scanner.finish()?;
    Ok(sent)
}

async fn drain<S, B, BE>(cancel: &CancellationToken, body: &mut S)
where
    S: Stream<Item = Result<B, BE>> + Unpin,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => {}
        () = async {
            while let Some(Ok(_)) = body.next().await {}
        } => {}
    }
}
