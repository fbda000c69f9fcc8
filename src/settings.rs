//! Line settings and remote parameter negotiation
//!
//! Translates consumer-side line settings (baud rate, framing, flow
//! characters) into the compact negotiation message sent to the remote end
//! of a data-link channel. Only fields that actually changed are flagged in
//! the change mask; unchanged fields still carry the current value so the
//! peer sees a complete picture.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Parity setting for the emulated line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineParity {
    /// No parity bit
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Flow control setting for the emulated line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineFlowControl {
    /// No flow control
    None,
    /// Software flow control (XON/XOFF)
    Software,
    /// Hardware flow control (RTS/CTS)
    Hardware,
}

/// Default XON character (DC1)
pub const XON_CHAR_DEFAULT: u8 = 0x11;
/// Default XOFF character (DC3)
pub const XOFF_CHAR_DEFAULT: u8 = 0x13;

/// Wire code for 2400 baud
pub const BAUD_2400: u8 = 0x0;
/// Wire code for 4800 baud
pub const BAUD_4800: u8 = 0x1;
/// Wire code for 7200 baud
pub const BAUD_7200: u8 = 0x2;
/// Wire code for 9600 baud
pub const BAUD_9600: u8 = 0x3;
/// Wire code for 19200 baud
pub const BAUD_19200: u8 = 0x4;
/// Wire code for 38400 baud
pub const BAUD_38400: u8 = 0x5;
/// Wire code for 57600 baud
pub const BAUD_57600: u8 = 0x6;
/// Wire code for 115200 baud
pub const BAUD_115200: u8 = 0x7;
/// Wire code for 230400 baud
pub const BAUD_230400: u8 = 0x8;

/// Wire code for 5 data bits
pub const DATA_BITS_5: u8 = 0x0;
/// Wire code for 6 data bits
pub const DATA_BITS_6: u8 = 0x1;
/// Wire code for 7 data bits
pub const DATA_BITS_7: u8 = 0x2;
/// Wire code for 8 data bits
pub const DATA_BITS_8: u8 = 0x3;

/// Wire code for 1 stop bit
pub const STOP_BITS_1: u8 = 0x0;
/// Wire code for 1.5 stop bits
pub const STOP_BITS_1_5: u8 = 0x1;

/// Wire code for no parity
pub const PARITY_NONE: u8 = 0x0;
/// Wire code for odd parity
pub const PARITY_ODD: u8 = 0x1;
/// Wire code for even parity
pub const PARITY_EVEN: u8 = 0x3;

/// Wire code for no in-band flow control
pub const FLOW_NONE: u8 = 0x00;

/// Change mask bit: bit rate changed
pub const CHANGE_BITRATE: u16 = 0x0001;
/// Change mask bit: data bits changed
pub const CHANGE_DATA_BITS: u16 = 0x0002;
/// Change mask bit: stop bits changed
pub const CHANGE_STOP_BITS: u16 = 0x0004;
/// Change mask bit: parity changed
pub const CHANGE_PARITY: u16 = 0x0008;
/// Change mask bit: XON character changed
pub const CHANGE_XON_CHAR: u16 = 0x0020;
/// Change mask bit: XOFF character changed
pub const CHANGE_XOFF_CHAR: u16 = 0x0040;

/// Consumer-visible line settings for an emulated serial port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSettings {
    /// Baud rate in bits per second
    pub baud: u32,
    /// Data bits per character (5 to 8)
    pub data_bits: u8,
    /// Stop bits (1 or 2; 2 is not representable on the wire and is sent
    /// as the 1.5 stop-bit code)
    pub stop_bits: u8,
    /// Parity mode
    pub parity: LineParity,
    /// Flow control mode
    pub flow: LineFlowControl,
    /// XON character for software flow control
    pub xon_char: u8,
    /// XOFF character for software flow control
    pub xoff_char: u8,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: LineParity::None,
            flow: LineFlowControl::None,
            xon_char: XON_CHAR_DEFAULT,
            xoff_char: XOFF_CHAR_DEFAULT,
        }
    }
}

impl LineSettings {
    /// Create settings with the default 9600 8N1 profile
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the baud rate
    #[must_use]
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Set the number of data bits
    #[must_use]
    pub fn with_data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set the number of stop bits
    #[must_use]
    pub fn with_stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set the parity mode
    #[must_use]
    pub fn with_parity(mut self, parity: LineParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the flow control mode
    #[must_use]
    pub fn with_flow(mut self, flow: LineFlowControl) -> Self {
        self.flow = flow;
        self
    }
}

/// Remote port negotiation message
///
/// All value fields use wire codes, not raw values. The mask records which
/// fields the peer should apply; the rest are informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortNegotiation {
    /// Baud rate wire code
    pub baud: u8,
    /// Data bits wire code
    pub data_bits: u8,
    /// Stop bits wire code
    pub stop_bits: u8,
    /// Parity wire code
    pub parity: u8,
    /// Flow control wire code
    pub flow: u8,
    /// XON character
    pub xon_char: u8,
    /// XOFF character
    pub xoff_char: u8,
    /// Mask of changed fields
    pub mask: u16,
}

fn baud_code(baud: u32) -> u8 {
    match baud {
        2400 => BAUD_2400,
        4800 => BAUD_4800,
        7200 => BAUD_7200,
        9600 => BAUD_9600,
        19200 => BAUD_19200,
        38400 => BAUD_38400,
        57600 => BAUD_57600,
        115_200 => BAUD_115200,
        230_400 => BAUD_230400,
        _ => {
            // Unsupported rates fall back to the 9600 code rather than
            // failing the whole negotiation.
            warn!(baud, "unsupported baud rate, sending 9600");
            BAUD_9600
        }
    }
}

fn data_bits_code(bits: u8) -> u8 {
    match bits {
        5 => DATA_BITS_5,
        6 => DATA_BITS_6,
        7 => DATA_BITS_7,
        _ => DATA_BITS_8,
    }
}

fn stop_bits_code(bits: u8) -> u8 {
    // A request for 2 stop bits has no wire code and is coerced to 1.5.
    if bits == 2 {
        STOP_BITS_1_5
    } else {
        STOP_BITS_1
    }
}

fn parity_code(parity: LineParity) -> u8 {
    match parity {
        LineParity::None => PARITY_NONE,
        LineParity::Odd => PARITY_ODD,
        LineParity::Even => PARITY_EVEN,
    }
}

/// Compare old and new line settings and build the negotiation message
///
/// Returns `None` when nothing changed that the peer needs to hear about.
/// Turning hardware flow assist off is noted in the log but sends nothing,
/// since the wire format has no code for it.
#[must_use]
pub fn translate(old: &LineSettings, new: &LineSettings) -> Option<PortNegotiation> {
    let mut mask: u16 = 0;

    if old.flow == LineFlowControl::Hardware && new.flow != LineFlowControl::Hardware {
        warn!("turning off hardware flow control over the air is not supported");
    }

    if old.parity != new.parity {
        mask |= CHANGE_PARITY;
    }

    let mut xon_char = XON_CHAR_DEFAULT;
    if old.xon_char != new.xon_char {
        xon_char = new.xon_char;
        mask |= CHANGE_XON_CHAR;
    }

    let mut xoff_char = XOFF_CHAR_DEFAULT;
    if old.xoff_char != new.xoff_char {
        xoff_char = new.xoff_char;
        mask |= CHANGE_XOFF_CHAR;
    }

    if old.stop_bits != new.stop_bits {
        mask |= CHANGE_STOP_BITS;
    }

    if old.data_bits != new.data_bits {
        mask |= CHANGE_DATA_BITS;
    }

    if old.baud != new.baud {
        mask |= CHANGE_BITRATE;
    }

    if mask == 0 {
        return None;
    }

    debug!(mask = format_args!("{mask:#06x}"), "line settings changed");

    Some(PortNegotiation {
        baud: baud_code(new.baud),
        data_bits: data_bits_code(new.data_bits),
        stop_bits: stop_bits_code(new.stop_bits),
        parity: parity_code(new.parity),
        flow: FLOW_NONE,
        xon_char,
        xoff_char,
        mask,
    })
}
