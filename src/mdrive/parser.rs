//! MDrive response-stream parser.
//!
//! The units speak a line-oriented ASCII protocol with several framing
//! variants layered on top of each other, depending on the unit's checksum
//! (`CK`) and echo (`EM`) modes:
//!
//! ```text
//! command response:  [echo of sent frame] [ACK|NACK] <payload> [chk] \r\n [> | ? | ACK]
//! event frame:       ! " <addr> " ? <code> [chk] <ACK>
//! upgrade sentinel:  $
//! ```
//!
//! [`Response::feed`] consumes bytes one chunk at a time and accumulates one
//! framing unit.  The same `Response` must be fed repeatedly until its
//! `processed` flag is set; partial reads land wherever the serial timing
//! splits them, so every rule here has to hold across chunk boundaries.

/// Response payload capacity.  A payload that reaches `PAYLOAD_CAP - 1`
/// closes the frame as an overflow (garbage input, most likely).
pub const PAYLOAD_CAP: usize = 64;

/// Raw-byte capture window used for checksum validation.  Bigger than the
/// payload cap because echoes and control bytes count toward it.
const RAW_CAP: usize = 96;

const ACK: u8 = 0x06;
const NACK: u8 = 0x15;

/// Compute the MDrive frame checksum: the 2's complement of the 7-bit sum of
/// all bytes, OR'd with 0x80.
pub fn calc_checksum(buffer: &[u8]) -> u8 {
    let sum = buffer
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1) | 0x80
}

/// Validate a received checksum byte against the window it covers.
pub fn check_checksum(buffer: &[u8], checksum: u8) -> bool {
    if buffer.is_empty() || checksum & 0x80 != 0x80 {
        return false;
    }
    checksum == calc_checksum(buffer)
}

/// One framing unit received from a bus, plus the parser state needed to
/// accumulate it across reads.
#[derive(Clone)]
pub struct Response {
    payload: [u8; PAYLOAD_CAP],
    length: usize,
    raw: [u8; RAW_CAP],
    /// Total bytes received for this response (may exceed `RAW_CAP`).
    pub received: usize,
    /// Transaction id stamped by the reader when the response is queued.
    pub txid: u32,
    /// Address of the unit emitting an event frame (0 = none).
    pub address: u8,
    /// Error or event code indicated by the unit.
    pub code: u16,

    ack_location: Option<usize>,
    pub ack: bool,
    pub nack: bool,
    pub checksum_good: bool,
    pub event: bool,
    pub error: bool,
    /// Set when no more input is anticipated for this response.
    pub processed: bool,
    /// Response included an echo from the unit.
    pub echo: bool,
    pub prompt: bool,
    pub crlf: bool,

    in_error: bool,
    prev: u8,
    expect_event_addr: bool,
    expect_close_quote: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Response({}{}{}{}{}{}:{} {}:{:?})",
            if self.ack { "A" } else { "" },
            if self.nack { "N" } else { "" },
            if self.checksum_good { "C" } else { "" },
            if self.echo { "E" } else { "" },
            if self.prompt || self.crlf { ">" } else { "" },
            if self.error { "?" } else { "" },
            self.code,
            self.length,
            String::from_utf8_lossy(self.payload_bytes()),
        )
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            payload: [0; PAYLOAD_CAP],
            length: 0,
            raw: [0; RAW_CAP],
            received: 0,
            txid: 0,
            address: 0,
            code: 0,
            ack_location: None,
            ack: false,
            nack: false,
            checksum_good: false,
            event: false,
            error: false,
            processed: false,
            echo: false,
            prompt: false,
            crlf: false,
            in_error: false,
            prev: 0,
            expect_event_addr: false,
            expect_close_quote: false,
        }
    }

    /// Discard all accumulated state (stale transaction).
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// The accumulated payload bytes.
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload[..self.length]
    }

    /// Payload as text (the protocol is ASCII).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.payload_bytes()).into_owned()
    }

    pub fn payload_len(&self) -> usize {
        self.length
    }

    /// Discard the payload after it proved to be an echo of the sent
    /// command (EM=0 closes the response on the echo alone).
    pub fn strip_echo(&mut self) {
        self.length = 0;
        self.echo = true;
    }

    /// Fold another partial response into this one.  Used when a slow unit
    /// ACKs receipt first and sends the data payload in a later frame.
    pub fn combine(&mut self, other: &Response) {
        self.ack |= other.ack;
        self.nack |= other.nack;
        self.prompt |= other.prompt;
        self.crlf |= other.crlf;
        self.error |= other.error;
        self.processed |= other.processed;
        self.checksum_good |= other.checksum_good;
        if other.code != 0 {
            self.code = other.code;
        }
        self.received += other.received;
        let take = other.length.min(PAYLOAD_CAP - self.length);
        self.payload[self.length..self.length + take]
            .copy_from_slice(&other.payload[..take]);
        self.length += take;
    }

    /// Feed a chunk of received bytes.  Returns the number of bytes
    /// consumed; the remainder belongs to the next framing unit.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        let mut i = 0;
        while i < data.len() && !self.processed {
            let b = data[i];

            // Event-frame address capture spans three bytes ("a") that may
            // arrive in separate reads.
            if self.expect_event_addr {
                self.address = b;
                self.expect_event_addr = false;
                self.expect_close_quote = true;
                self.record(b);
                i += 1;
                continue;
            }
            if self.expect_close_quote {
                self.expect_close_quote = false;
                self.record(b);
                i += 1;
                continue;
            }

            match b {
                b'\n' => {
                    // LF after CR marks the absolute end of transmission.
                    // Some modes tack on one more char: '>' (prompt, EM=0),
                    // '?' (error prompt), or a trailing ACK after an
                    // in-program print in checksum mode.  Consume it too.
                    if self.prev == b'\r' {
                        self.processed = true;
                        self.crlf = true;
                        self.record(b);
                        i += 1;
                        match data.get(i) {
                            Some(b'>') => {
                                self.prompt = true;
                                self.record(b'>');
                                i += 1;
                            }
                            Some(b'?') => {
                                self.error = true;
                                self.record(b'?');
                                i += 1;
                            }
                            Some(&ACK) => {
                                self.record(ACK);
                                i += 1;
                            }
                            _ => {}
                        }
                        continue;
                    }
                    self.normal_char(b);
                }
                b'\r' => {
                    // Delimiter: only bytes before the preceding checksum
                    // char count toward the payload.  Not added.
                }
                ACK | NACK => {
                    if b == ACK {
                        self.ack = true;
                        self.ack_location = Some(self.received);
                    } else {
                        self.nack = true;
                    }

                    if self.event {
                        // The ACK marks the end of an event frame.
                        self.processed = true;
                        if self.checksum_good && self.length > 0 {
                            // Drop the (good) checksum from the payload.
                            self.length -= 1;
                        }
                    } else if self.length > 0 && self.prev == b'\n' {
                        // An ACK/NACK mid-stream right after a newline means
                        // everything before it was an echo of the command we
                        // sent (EM=0).  Drop it.
                        self.length = 0;
                        self.echo = true;
                        self.checksum_good = false;
                    }
                }
                b'?' => {
                    // Error code follows.
                    self.in_error = true;
                    self.error = true;
                }
                b'>' => {
                    // Prompts occur immediately before the \r (custom
                    // firmware, EM=1) or after the \n (handled above).  A
                    // leading '>' is carry-over from a previous response.
                    if data.get(i + 1) == Some(&b'\r') {
                        self.prompt = true;
                    } else if self.length != 0 {
                        self.normal_char(b);
                    }
                }
                b'!' => {
                    // As the first payload char this begins an event frame:
                    // !"a"?<code>
                    if self.length == 0 {
                        self.event = true;
                    } else {
                        self.normal_char(b);
                    }
                }
                b'"' => {
                    if self.event && self.address == 0 && self.length == 0 {
                        self.expect_event_addr = true;
                    } else {
                        self.normal_char(b);
                    }
                }
                _ => {
                    if b & 0x80 != 0 && !self.checksum_good {
                        // Candidate checksum byte: validate across the window
                        // from the ACK/NACK (or frame start) up to, but not
                        // including, this byte.
                        let start = match self.ack_location {
                            Some(loc) if loc > 0 => loc,
                            _ => usize::from(self.ack || self.nack),
                        };
                        let end = self.received.min(RAW_CAP);
                        if start < end && check_checksum(&self.raw[start..end], b) {
                            self.checksum_good = true;
                            self.record(b);
                            i += 1;
                            continue;
                        }
                    }
                    self.normal_char(b);
                }
            }

            self.record(b);
            i += 1;
        }

        // A lone '$' is the bootloader announcing itself; it arrives with no
        // CR/LF framing at all.
        if self.length == 1 && self.payload[0] == b'$' {
            self.processed = true;
        }

        i
    }

    fn normal_char(&mut self, b: u8) {
        if self.in_error {
            if b.is_ascii_digit() {
                self.code = self.code * 10 + u16::from(b - b'0');
                return;
            }
            self.in_error = false;
        }

        if self.length < PAYLOAD_CAP {
            self.payload[self.length] = b;
            self.length += 1;
        }

        // Receive-buffer overflow: close the frame.
        if self.length == PAYLOAD_CAP - 1 {
            self.processed = true;
        }
    }

    fn record(&mut self, b: u8) {
        if self.received < RAW_CAP {
            self.raw[self.received] = b;
        }
        self.received += 1;
        self.prev = b;
    }
}
