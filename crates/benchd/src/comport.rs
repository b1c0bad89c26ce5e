// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Telnet COM-PORT-OPTION (RFC 2217) framing.
//!
//! The proxy speaks the subset flashing tools use: option negotiation for
//! BINARY/SGA/COM-PORT, `SET-BAUDRATE`/`SET-DATASIZE`/`SET-PARITY`/
//! `SET-STOPSIZE`, `SET-CONTROL` for DTR/RTS/break, and `PURGE-DATA`.
//! Control requests are passed through verbatim; the codec never injects
//! its own reset sequence.

// Telnet command bytes.
pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

// Telnet options.
pub const OPT_BINARY: u8 = 0;
pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_COM_PORT: u8 = 44;

// COM-PORT-OPTION subnegotiation commands (client → access server).
pub const SET_BAUDRATE: u8 = 1;
pub const SET_DATASIZE: u8 = 2;
pub const SET_PARITY: u8 = 3;
pub const SET_STOPSIZE: u8 = 4;
pub const SET_CONTROL: u8 = 5;
pub const PURGE_DATA: u8 = 12;

/// Server responses echo the client command code plus 100.
pub const SERVER_OFFSET: u8 = 100;

// SET-CONTROL values.
pub const CONTROL_BREAK_ON: u8 = 5;
pub const CONTROL_BREAK_OFF: u8 = 6;
pub const CONTROL_DTR_ON: u8 = 8;
pub const CONTROL_DTR_OFF: u8 = 9;
pub const CONTROL_RTS_ON: u8 = 11;
pub const CONTROL_RTS_OFF: u8 = 12;

/// Decoded client intent, applied by the proxy to the device fd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialAction {
    /// Plain payload bytes for the device.
    Data(Vec<u8>),
    SetBaud(u32),
    SetDataSize(u8),
    SetParity(u8),
    SetStopSize(u8),
    SetDtr(bool),
    SetRts(bool),
    SetBreak(bool),
    Purge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Data,
    Iac,
    Verb(u8),
    Sub,
    SubIac,
}

/// Incremental decoder for one client connection.
#[derive(Debug)]
pub struct ComPortCodec {
    state: DecodeState,
    data: Vec<u8>,
    subneg: Vec<u8>,
}

impl Default for ComPortCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ComPortCodec {
    pub fn new() -> Self {
        Self { state: DecodeState::Data, data: Vec::new(), subneg: Vec::new() }
    }

    /// Feed client bytes. Decoded actions are appended to `actions`;
    /// negotiation replies for the client socket go to `replies`.
    pub fn decode(&mut self, input: &[u8], actions: &mut Vec<SerialAction>, replies: &mut Vec<u8>) {
        for &byte in input {
            match self.state {
                DecodeState::Data => {
                    if byte == IAC {
                        self.state = DecodeState::Iac;
                    } else {
                        self.data.push(byte);
                    }
                }
                DecodeState::Iac => match byte {
                    IAC => {
                        self.data.push(IAC);
                        self.state = DecodeState::Data;
                    }
                    WILL | WONT | DO | DONT => self.state = DecodeState::Verb(byte),
                    SB => {
                        self.subneg.clear();
                        self.state = DecodeState::Sub;
                    }
                    _ => self.state = DecodeState::Data,
                },
                DecodeState::Verb(verb) => {
                    self.negotiate(verb, byte, replies);
                    self.state = DecodeState::Data;
                }
                DecodeState::Sub => {
                    if byte == IAC {
                        self.state = DecodeState::SubIac;
                    } else {
                        self.subneg.push(byte);
                    }
                }
                DecodeState::SubIac => match byte {
                    SE => {
                        self.flush_data(actions);
                        let subneg = std::mem::take(&mut self.subneg);
                        process_subneg(&subneg, actions, replies);
                        self.state = DecodeState::Data;
                    }
                    IAC => {
                        self.subneg.push(IAC);
                        self.state = DecodeState::Sub;
                    }
                    _ => self.state = DecodeState::Sub,
                },
            }
        }
        self.flush_data(actions);
    }

    fn flush_data(&mut self, actions: &mut Vec<SerialAction>) {
        if !self.data.is_empty() {
            actions.push(SerialAction::Data(std::mem::take(&mut self.data)));
        }
    }

    fn negotiate(&mut self, verb: u8, option: u8, replies: &mut Vec<u8>) {
        let supported = matches!(option, OPT_BINARY | OPT_SGA | OPT_COM_PORT | OPT_ECHO);
        match verb {
            DO => {
                replies.extend_from_slice(&[IAC, if supported { WILL } else { WONT }, option]);
            }
            WILL => {
                replies.extend_from_slice(&[IAC, if supported { DO } else { DONT }, option]);
            }
            // WONT/DONT need no answer.
            _ => {}
        }
    }
}

fn process_subneg(subneg: &[u8], actions: &mut Vec<SerialAction>, replies: &mut Vec<u8>) {
    let [OPT_COM_PORT, command, payload @ ..] = subneg else {
        return;
    };
    match (*command, payload) {
        (SET_BAUDRATE, [a, b, c, d]) => {
            let rate = u32::from_be_bytes([*a, *b, *c, *d]);
            if rate != 0 {
                actions.push(SerialAction::SetBaud(rate));
            }
            subneg_reply(SET_BAUDRATE, payload, replies);
        }
        (SET_DATASIZE, [bits]) => {
            if *bits != 0 {
                actions.push(SerialAction::SetDataSize(*bits));
            }
            subneg_reply(SET_DATASIZE, payload, replies);
        }
        (SET_PARITY, [parity]) => {
            if *parity != 0 {
                actions.push(SerialAction::SetParity(*parity));
            }
            subneg_reply(SET_PARITY, payload, replies);
        }
        (SET_STOPSIZE, [stop]) => {
            if *stop != 0 {
                actions.push(SerialAction::SetStopSize(*stop));
            }
            subneg_reply(SET_STOPSIZE, payload, replies);
        }
        (SET_CONTROL, [value]) => {
            match *value {
                CONTROL_BREAK_ON => actions.push(SerialAction::SetBreak(true)),
                CONTROL_BREAK_OFF => actions.push(SerialAction::SetBreak(false)),
                CONTROL_DTR_ON => actions.push(SerialAction::SetDtr(true)),
                CONTROL_DTR_OFF => actions.push(SerialAction::SetDtr(false)),
                CONTROL_RTS_ON => actions.push(SerialAction::SetRts(true)),
                CONTROL_RTS_OFF => actions.push(SerialAction::SetRts(false)),
                _ => {}
            }
            subneg_reply(SET_CONTROL, payload, replies);
        }
        (PURGE_DATA, _) => {
            actions.push(SerialAction::Purge);
            subneg_reply(PURGE_DATA, payload, replies);
        }
        _ => {}
    }
}

/// Build `IAC SB COM-PORT <cmd+100> <payload> IAC SE`, escaping IAC bytes
/// in the payload.
fn subneg_reply(command: u8, payload: &[u8], replies: &mut Vec<u8>) {
    replies.extend_from_slice(&[IAC, SB, OPT_COM_PORT, command + SERVER_OFFSET]);
    for &byte in payload {
        if byte == IAC {
            replies.push(IAC);
        }
        replies.push(byte);
    }
    replies.extend_from_slice(&[IAC, SE]);
}

/// Escape device bytes for the client socket (IAC doubled).
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        if byte == IAC {
            out.push(IAC);
        }
        out.push(byte);
    }
    out
}

#[cfg(test)]
#[path = "comport_tests.rs"]
mod tests;
