//! Behavioral wire doubles for protocol-level tests.
//!
//! [`ScriptedWire`] plays the target side of the SWD protocol: it decodes
//! request phases, answers each one with the next queued [`Response`] and
//! records everything the engine clocked out. [`ScriptedJtag`] does the
//! same for the scan chain, including the one-transaction result delay of
//! a real JTAG-DP.

use std::collections::VecDeque;

use super::{parity, JtagSequence, ParityError, SwdSequence};

/// A canned answer to one SWD request phase.
#[derive(Debug, Clone, Copy)]
pub struct Response {
    /// The 3-bit ACK to present.
    pub ack: u8,
    /// Data returned for a read once the ACK was OK.
    pub data: u32,
    /// Deliver the read data with a flipped parity bit.
    pub corrupt_parity: bool,
}

impl Response {
    /// An OK response carrying `data`.
    pub fn ok(data: u32) -> Self {
        Response {
            ack: 0b001,
            data,
            corrupt_parity: false,
        }
    }

    /// A WAIT response.
    pub fn wait() -> Self {
        Response {
            ack: 0b010,
            data: 0,
            corrupt_parity: false,
        }
    }

    /// A FAULT response.
    pub fn fault() -> Self {
        Response {
            ack: 0b100,
            data: 0,
            corrupt_parity: false,
        }
    }

    /// An arbitrary (usually protocol-violating) ACK value.
    pub fn ack(ack: u8) -> Self {
        Response {
            ack,
            data: 0,
            corrupt_parity: false,
        }
    }
}

/// One request the engine issued, as decoded from its 8-bit header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenRequest {
    /// True for an Access Port request, false for Debug Port.
    pub apndp: bool,
    /// True for a read.
    pub rnw: bool,
    /// Register address (A\[3:2\] shifted back into byte-address form).
    pub addr: u8,
    /// Data the engine clocked out, for writes.
    pub data: Option<u32>,
}

/// Scripted SWD target.
#[derive(Debug, Default)]
pub struct ScriptedWire {
    responses: VecDeque<Response>,
    current: Option<Response>,
    /// Every decoded request phase, in order.
    pub requests: Vec<SeenRequest>,
    /// Raw non-request output sequences (line resets, idle cycles).
    pub line_sequences: Vec<(u32, u8)>,
}

impl ScriptedWire {
    /// A wire with no queued responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the answer for the next request phase.
    pub fn respond(&mut self, response: Response) -> &mut Self {
        self.responses.push_back(response);
        self
    }

    /// Queue `n` copies of the same answer.
    pub fn respond_times(&mut self, response: Response, n: usize) -> &mut Self {
        for _ in 0..n {
            self.responses.push_back(response);
        }
        self
    }

    /// Panics if queued responses were left unconsumed.
    pub fn finish(&self) {
        assert!(
            self.responses.is_empty(),
            "{} scripted responses left unconsumed",
            self.responses.len()
        );
    }
}

impl SwdSequence for ScriptedWire {
    fn seq_out(&mut self, value: u32, cycles: u8) {
        // A request phase is 8 bits with the start and park bits set.
        if cycles == 8 && value & 0x81 == 0x81 {
            let apndp = value & 0x02 != 0;
            let rnw = value & 0x04 != 0;
            let addr = (((value >> 3) & 0x03) as u8) << 2;
            self.requests.push(SeenRequest {
                apndp,
                rnw,
                addr,
                data: None,
            });
            self.current = Some(
                self.responses
                    .pop_front()
                    .expect("engine issued a request with no scripted response"),
            );
        } else {
            self.line_sequences.push((value, cycles));
        }
    }

    fn seq_out_parity(&mut self, value: u32, cycles: u8) {
        assert_eq!(cycles, 32, "only data phases carry parity out");
        if let Some(request) = self.requests.last_mut() {
            request.data = Some(value);
        }
    }

    fn seq_in(&mut self, cycles: u8) -> u32 {
        assert_eq!(cycles, 3, "only the ACK phase is read without parity");
        let response = self
            .current
            .expect("ACK read outside of a request exchange");
        u32::from(response.ack)
    }

    fn seq_in_parity(&mut self, cycles: u8) -> Result<u32, ParityError> {
        assert_eq!(cycles, 32, "only data phases carry parity in");
        let response = self
            .current
            .take()
            .expect("data read outside of a request exchange");
        if response.corrupt_parity {
            Err(ParityError)
        } else {
            Ok(response.data)
        }
    }
}

/// Scripted JTAG-DP scan chain.
///
/// Reproduces the pipelining of the real hardware: the data returned by a
/// DPACC/APACC shift is the result of the *previous* queued transaction.
#[derive(Debug, Default)]
pub struct ScriptedJtag {
    /// ACKs to deliver for upcoming 35-bit shifts.
    acks: VecDeque<u8>,
    /// Results for queued read transactions, delivered one shift late.
    read_results: VecDeque<u32>,
    pending: u32,
    ir: u64,
    /// The identification code preloaded into the DR path by a TAP reset.
    pub idcode: u32,
    /// Every (ir, payload) pair shifted through the DR.
    pub transactions: Vec<(u64, u64)>,
}

impl ScriptedJtag {
    /// A chain answering OK to everything.
    pub fn new() -> Self {
        ScriptedJtag {
            idcode: 0x3BA0_0477,
            ..Self::default()
        }
    }

    /// Queue the ACK for the next DR shift (defaults to OK when empty).
    pub fn respond_ack(&mut self, ack: u8) -> &mut Self {
        self.acks.push_back(ack);
        self
    }

    /// Queue the result of the next read transaction.
    pub fn queue_read(&mut self, value: u32) -> &mut Self {
        self.read_results.push_back(value);
        self
    }
}

impl JtagSequence for ScriptedJtag {
    fn tms_seq(&mut self, _tms: u32, _cycles: u8) {}

    fn shift(&mut self, data: u64, cycles: u8, _exit: bool) -> u64 {
        if cycles <= 8 {
            // Instruction register shift.
            self.ir = data;
            return 0;
        }
        if cycles == 32 {
            // IDCODE scan after a TAP reset.
            return u64::from(self.idcode);
        }

        assert_eq!(cycles, 35, "DPACC/APACC shifts are 35 bits");
        self.transactions.push((self.ir, data));

        let ack = self.acks.pop_front().unwrap_or(0b010 /* OK/FAULT */);
        let result = u64::from(self.pending) << 3 | u64::from(ack);

        // A WAIT leaves the pipeline untouched; an accepted read queues
        // its result for the next shift.
        if ack == 0b010 {
            if data & 1 != 0 {
                self.pending = self.read_results.pop_front().unwrap_or(0);
            } else {
                self.pending = 0;
            }
        }

        result
    }
}
