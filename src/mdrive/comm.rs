//! Synchronous command/response exchange with a unit.
//!
//! [`Device::communicate`] owns the whole transaction: frame the command,
//! hold the bus transaction lock, pace and write the bytes, then block on
//! the bus response stack with an autosensed timeout.  Retries, latency
//! learning, per-unit statistics, and the automatic error-code lookup all
//! live here.
//!
//! Recovery requests (fetching `ER`, clearing the error flag) run against
//! the already-held transaction lock through [`Device::transact`] with a
//! deeper nest level, so the lock is never re-entered and the recursion can
//! never go past one level.

use log::{debug, trace};
use std::thread;
use std::time::{Duration, Instant};

use super::parser::{calc_checksum, Response};
use super::port::{xmit_time, BusTx};
use super::{ChecksumMode, Device, EchoMode};
use crate::error::{device_code, DriverError, Result};

/// Default retry ceiling added to the first try when the caller does not
/// override the budget.
pub const MAX_RETRIES: u32 = 1;

/// Latency seed used until a unit has answered once (and whenever it is in
/// quiet mode, where latency cannot be observed).
const LATENCY_SEED: Duration = Duration::from_millis(15);

/// Allowed deviation on top of the learned latency for the first response.
const LATENCY_SLACK: Duration = Duration::from_millis(40);

/// Classification of one completed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// The response was clean.
    Ok,
    /// The unit dropped the command (error 63) and it can be resent.
    Retry,
    /// An error exists on the unit; its code was decoded.
    Error,
    /// The unit refused the command (comm noise, most likely).
    Nack,
    /// The unit-sent checksum does not validate.
    BadChecksum,
    /// The response fits no known shape.
    Unknown,
    /// No response within the timeout.
    Timeout,
    /// Unable to push bytes to the unit at all.
    IoError,
}

/// Options for one exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOpts {
    /// Expect a data payload beyond the usual prompt/ACK/NACK, and extend
    /// the timeout for it.
    pub expect_data: bool,
    /// An error indication from the unit is handled by the caller; don't
    /// retry or auto-fetch on it.
    pub expect_err: bool,
    /// Omit the trailing CR/LF.
    pub raw: bool,
    /// Attempt the transmission this many times instead of the default
    /// `1 + MAX_RETRIES`.
    pub tries: Option<u32>,
    /// Non-standard first-response wait, for commands with unusual timing
    /// (`S`, `FD`, reboot).
    pub waittime: Option<Duration>,
}

impl SendOpts {
    pub fn data() -> Self {
        Self {
            expect_data: true,
            ..Self::default()
        }
    }
}

/// Result of one exchange: the classification plus the response, when one
/// was received.
#[derive(Debug)]
pub struct Exchange {
    pub class: ResponseClass,
    pub response: Option<Response>,
}

impl Exchange {
    pub fn is_ok(&self) -> bool {
        self.class == ResponseClass::Ok
    }
}

/// Snapshot of the comm-relevant device state for one exchange.  Taken once
/// per transact so a mode repair mid-classification affects the next
/// exchange, not the frame already on the wire.
struct CommSnapshot {
    address: u8,
    party_mode: bool,
    checksum: ChecksumMode,
    echo: EchoMode,
    speed: u32,
    latency: Duration,
}

/// Frame an outgoing command: address prefix in party mode, LF terminator
/// (party) or CR (single), checksum byte inserted before the terminator.
/// In raw mode no terminator is added and the checksum (if any) trails the
/// last byte.
pub(crate) fn frame_command(
    command: &[u8],
    address: u8,
    party: bool,
    checksum: bool,
    raw: bool,
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(command.len() + 3);
    if party {
        frame.push(address);
    }
    frame.extend_from_slice(command);
    if !raw {
        frame.push(if party { b'\n' } else { b'\r' });
    }

    if checksum {
        if raw {
            let ck = calc_checksum(&frame);
            frame.push(ck);
        } else {
            // The terminator is not part of the checksum window.
            let term = frame.pop().expect("terminator present");
            let ck = calc_checksum(&frame);
            frame.push(ck);
            frame.push(term);
        }
    }
    frame
}

impl Device {
    // ── Public entry points ───────────────────────────────────

    /// Send `command` and wait for the matching response.
    ///
    /// The receive timeout is autosensed: the learned unit latency plus
    /// 40 ms for the first byte, extended by `25 ms + 62 character times`
    /// when a data payload is expected and only an ACK has arrived.
    pub fn communicate(&self, command: &str, opts: &SendOpts) -> Exchange {
        let mut tx = self.bus.lock_tx();
        // No other responses can be in flight at nest depth zero.
        self.bus.flush_responses();
        self.transact(&mut tx, command.as_bytes(), opts, 1)
    }

    /// Fire-and-check: send a command that produces no data payload.
    pub fn send(&self, command: &str) -> ResponseClass {
        self.communicate(command, &SendOpts::default()).class
    }

    /// Read one variable as text (`PR <var>`).
    pub fn get_string(&self, variable: &str) -> Result<String> {
        let exchange = self.communicate(&format!("PR {variable}"), &SendOpts::data());
        if !exchange.is_ok() {
            return Err(DriverError::Io);
        }
        Ok(exchange
            .response
            .map(|r| r.text().trim().to_owned())
            .unwrap_or_default())
    }

    /// Read one variable as an integer.
    pub fn get_integer(&self, variable: &str) -> Result<i64> {
        let text = self.get_string(variable)?;
        text.trim().parse().map_err(|_| DriverError::Io)
    }

    /// Read several variables with one command.  The request is composed as
    /// `PR a," ",b," ",c` and the unit answers with space-separated values,
    /// so all registers are sampled in one atomic exchange.
    pub fn get_integers(&self, variables: &[&str]) -> Result<Vec<i64>> {
        let mut command = String::from("PR ");
        for (i, var) in variables.iter().enumerate() {
            if i > 0 {
                command.push_str(",\" \",");
            }
            command.push_str(var);
        }

        let exchange = self.communicate(&command, &SendOpts::data());
        if !exchange.is_ok() {
            return Err(DriverError::Io);
        }
        let response = exchange.response.ok_or(DriverError::Io)?;
        let text = response.text();
        let values: Vec<i64> = text
            .split_whitespace()
            .map(str::parse)
            .collect::<core::result::Result<_, _>>()
            .map_err(|_| DriverError::Io)?;
        if values.len() != variables.len() {
            return Err(DriverError::Io);
        }
        Ok(values)
    }

    // ── Transaction engine ────────────────────────────────────

    fn comm_snapshot(&self) -> CommSnapshot {
        let mut state = self.state.lock().unwrap();
        // Until the unit has answered once there is nothing learned; quiet
        // units never teach us anything.
        if state.stats.latency_ns == 0 || state.echo == EchoMode::Quiet {
            state.stats.latency_ns = LATENCY_SEED.as_nanos() as u64;
        }
        CommSnapshot {
            address: state.address,
            party_mode: state.party_mode,
            checksum: state.checksum,
            echo: state.echo,
            speed: state.speed,
            latency: Duration::from_nanos(state.stats.latency_ns),
        }
    }

    /// One framed exchange against an already-held transaction lock.
    /// `nest` is 1 for a caller-initiated exchange and deeper for recovery
    /// requests issued from classification.
    pub(crate) fn transact(
        &self,
        tx: &mut BusTx,
        command: &[u8],
        opts: &SendOpts,
        nest: u32,
    ) -> Exchange {
        let snap = self.comm_snapshot();
        let one_char = xmit_time(snap.speed, 1);
        let more_wait = Duration::from_millis(25) + one_char * 62;
        let first_wait = opts.waittime.unwrap_or(snap.latency + LATENCY_SLACK);
        let tries = opts.tries.unwrap_or(1 + self.settings.max_retries);

        let frame = frame_command(
            command,
            snap.address,
            snap.party_mode,
            snap.checksum.enabled(),
            opts.raw,
        );

        let mut status = ResponseClass::Timeout;
        let mut response: Option<Response> = None;

        'attempt: for _ in 0..tries {
            // A new txid marks any previously received data as stale.
            let txid = self.bus.next_txid();

            if self.write_buffer(tx, &frame, &snap).is_err() {
                return Exchange {
                    class: ResponseClass::IoError,
                    response: None,
                };
            }

            let mut deadline = Instant::now() + first_wait;
            if !snap.checksum.enabled() {
                // Without checksum mode there is no early ACK; give the
                // payload budget up front.
                deadline += more_wait;
            }

            loop {
                let Some(incoming) = self.bus.wait_response(deadline) else {
                    if snap.echo == EchoMode::Quiet && !opts.expect_data {
                        // A quiet unit answers nothing on success.
                        return Exchange {
                            class: ResponseClass::Ok,
                            response: None,
                        };
                    }
                    self.state.lock().unwrap().stats.timeouts += 1;
                    debug!("mdrive '{}': timed out", snap.address as char);
                    status = ResponseClass::Timeout;
                    self.drop_for_retry(&mut response);
                    continue 'attempt;
                };

                match response.as_mut() {
                    // A slow unit ACKs first and sends data later; fold the
                    // pieces together.
                    Some(existing) => existing.combine(&incoming),
                    None => {
                        self.learn_latency(tx, &incoming, one_char);
                        response = Some(incoming);
                    }
                }
                let resp = response.as_mut().expect("response just stored");
                trace!("mdrive '{}': rx {:?}", snap.address as char, resp);

                if resp.txid != txid {
                    debug!(
                        "mdrive '{}': stale txid {} (expected {})",
                        snap.address as char, resp.txid, txid
                    );
                    self.drop_for_retry(&mut response);
                    continue 'attempt;
                }

                if opts.expect_data
                    && resp.payload_len() == 0
                    && (resp.ack || resp.nack || resp.crlf)
                {
                    // Handle an embedded error condition if one exists;
                    // otherwise the data just hasn't arrived yet.
                    let class = self.classify(tx, resp, nest);
                    if resp.code != 0 {
                        status = class;
                        if class == ResponseClass::Retry {
                            // Overflow (63): the unit dropped the command,
                            // so resend while tries remain.
                            self.state.lock().unwrap().stats.overflows += 1;
                            self.drop_for_retry(&mut response);
                            continue 'attempt;
                        }
                        break 'attempt;
                    }
                    trace!("mdrive '{}': waiting longer", snap.address as char);
                    deadline += more_wait;
                    continue;
                }

                if opts.expect_data
                    && snap.echo == EchoMode::On
                    && resp.payload_len() > 0
                    && frame.starts_with(resp.payload_bytes())
                {
                    // Full-echo mode closed the response on the echo alone;
                    // the real data is still coming.
                    resp.strip_echo();
                    deadline += more_wait;
                    continue;
                }

                {
                    let mut state = self.state.lock().unwrap();
                    if resp.ack {
                        state.stats.acks += 1;
                    }
                    if resp.nack {
                        state.stats.nacks += 1;
                    }
                }

                status = self.classify(tx, resp, nest);
                match status {
                    // Error 63 always retries while tries remain, even for
                    // callers managing errors themselves.
                    ResponseClass::Retry => {
                        self.state.lock().unwrap().stats.overflows += 1;
                    }
                    ResponseClass::Ok => break 'attempt,
                    _ if opts.expect_err => break 'attempt,
                    // A decoded device error is surfaced, not retried.
                    ResponseClass::Error => break 'attempt,
                    ResponseClass::BadChecksum => {
                        self.state.lock().unwrap().stats.bad_checksums += 1;
                    }
                    ResponseClass::Unknown => {
                        debug!("mdrive '{}': UNKNOWN response", snap.address as char);
                    }
                    _ => {}
                }
                self.drop_for_retry(&mut response);
                continue 'attempt;
            }
        }

        match response.take() {
            Some(resp) => {
                self.account_rx(&resp);
                Exchange {
                    class: status,
                    response: Some(resp),
                }
            }
            None => {
                debug!("mdrive '{}': out of retries", snap.address as char);
                Exchange {
                    class: status,
                    response: None,
                }
            }
        }
    }

    /// Put one framed command on the wire, enforcing the inter-transaction
    /// gap and the per-device line speed.
    fn write_buffer(
        &self,
        tx: &mut BusTx,
        frame: &[u8],
        snap: &CommSnapshot,
    ) -> core::result::Result<(), std::io::Error> {
        trace!("bus {} tx: {:02x?}", self.bus.id(), frame);

        if !self.settings.min_tx_gap.is_zero() {
            let earliest = self.bus.last_activity() + self.settings.min_tx_gap;
            let now = Instant::now();
            if earliest > now {
                thread::sleep(earliest - now);
            }
        }

        // Units sharing one bus may run at different speeds.
        if tx.speed != snap.speed {
            tx.io.set_baud(snap.speed)?;
            tx.speed = snap.speed;
            self.bus.note_speed(snap.speed);
        }

        tx.io.write_all(frame)?;
        // Flush so the transmission time stays out of the receive timeout.
        tx.io.drain()?;

        tx.last_tx = Instant::now();
        self.bus.touch_activity();

        let mut state = self.state.lock().unwrap();
        state.stats.tx += 1;
        state.stats.txbytes += frame.len() as u32;
        Ok(())
    }

    /// First-response latency, averaged over 32 transmissions.  Receive
    /// time is backed out so only the unit's think-time is learned.
    fn learn_latency(&self, tx: &BusTx, response: &Response, one_char: Duration) {
        let elapsed = tx.last_tx.elapsed().as_nanos() as u64;
        let receive = one_char.as_nanos() as u64 * response.received as u64;
        let measured = elapsed.saturating_sub(receive);

        let mut state = self.state.lock().unwrap();
        state.stats.latency_ns = ((31 * state.stats.latency_ns) >> 5) + (measured >> 5);
    }

    fn account_rx(&self, response: &Response) {
        let mut state = self.state.lock().unwrap();
        state.stats.rx += 1;
        state.stats.rxbytes += response.received as u32;
    }

    fn drop_for_retry(&self, response: &mut Option<Response>) {
        if let Some(resp) = response.take() {
            self.account_rx(&resp);
        }
        self.state.lock().unwrap().stats.resends += 1;
    }

    // ── Classification ────────────────────────────────────────

    /// Interpret a completed response.  If an error condition is present
    /// without a code, the code is read from the unit (one level deep
    /// only); the unit's error flag is always cleared before returning, and
    /// codes with an event mapping are signalled.
    fn classify(
        &self,
        tx: &mut BusTx,
        response: &mut Response,
        nest: u32,
    ) -> ResponseClass {
        let checksum_mode = {
            let state = self.state.lock().unwrap();
            state.checksum
        };

        if checksum_mode.enabled() {
            // Require no data, or a good checksum over the returned data.
            if (response.payload_len() > 0) == response.checksum_good {
                if response.ack {
                    return ResponseClass::Ok;
                } else if response.nack {
                    // An error exists on the unit; which one must be asked.
                    response.error = true;
                }
                // A bare prompt here means the unit just left checksum
                // mode; fall through to the non-checksum rules.
            } else if response.nack {
                return ResponseClass::Nack;
            } else if !response.checksum_good {
                return ResponseClass::BadChecksum;
            }
        }

        if response.error {
            if response.code == 0 {
                // Don't recurse again to find this.
                if nest == 1 && !self.state.lock().unwrap().ignore_errors {
                    if let Some(code) = self.fetch_error_code(tx, nest) {
                        response.code = code;
                    }
                }
            } else {
                // The unit sent the code itself; clear its error flag.
                self.clear_error(tx, nest);
            }

            if response.code != 0 {
                self.signal_error_event(response.code);
                return if response.code == device_code::OVERRUN {
                    ResponseClass::Retry
                } else {
                    ResponseClass::Error
                };
            } else if response.nack {
                return ResponseClass::Nack;
            }
            // Else: erroneous error indication; fall through.
        } else if response.prompt || response.crlf {
            // Stock firmware sends only CRLF in EM=1; both mean accepted.
            return ResponseClass::Ok;
        } else if response.nack
            && response.payload_len() == 0
            && checksum_mode == ChecksumMode::Off
        {
            // The unit is _really_ in checksum mode; repair the shadow.
            self.state.lock().unwrap().checksum = ChecksumMode::On;
        }

        ResponseClass::Unknown
    }

    /// Ask the unit for its current error code (`PR ER`).  The error flag
    /// makes the unit NACK everything — including this request — so the
    /// response classification is ignored here; recursing on it would loop.
    fn fetch_error_code(&self, tx: &mut BusTx, nest: u32) -> Option<u16> {
        let opts = SendOpts {
            expect_data: true,
            expect_err: true,
            tries: Some(1),
            ..SendOpts::default()
        };
        let exchange = self.transact(tx, b"PR ER", &opts, nest + 1);
        let text = exchange.response?.text();
        text.trim().parse().ok()
    }

    /// Clear the error flag on the unit.
    fn clear_error(&self, tx: &mut BusTx, nest: u32) {
        let opts = SendOpts {
            expect_err: true,
            tries: Some(1),
            ..SendOpts::default()
        };
        let _ = self.transact(tx, b"ER", &opts, nest + 1);
    }
}
