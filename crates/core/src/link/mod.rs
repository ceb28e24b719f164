//! Wire frames for the LED microcontroller and the physical links that carry
//! them.

pub mod channel;

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{BeatlightError, Result};

pub use channel::OutputChannel;

/// Largest pixel index the wire format can address. The index word is
/// offset by two so it never reads as EXIT (`0`) or FLUSH (`1`).
pub const MAX_PIXEL_INDEX: usize = u16::MAX as usize - PIXEL_INDEX_OFFSET;
/// Largest colour the three colour bytes can carry.
pub const MAX_COLOR: u32 = 0xFF_FF_FF;
const PIXEL_INDEX_OFFSET: usize = 2;

/// One unit of the microcontroller protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFrame {
    /// Enters pixel mode.
    Start,
    /// Leaves pixel mode.
    Exit,
    /// Latches every pixel written since the previous flush.
    Flush,
    /// Sets one pixel to a 24-bit colour; shown on the next FLUSH.
    SetPixel { index: u16, color: u32 },
}

impl OutputFrame {
    /// Builds a SET_PIXEL frame. Only indices `0..=65533`
    /// ([`MAX_PIXEL_INDEX`]) survive the offset index word, and colours
    /// must fit in 24 bits.
    pub fn set_pixel(index: usize, color: u32) -> Result<Self> {
        if index > MAX_PIXEL_INDEX {
            return Err(BeatlightError::PixelOutOfRange(index));
        }
        if color > MAX_COLOR {
            return Err(BeatlightError::ColorOutOfRange(color));
        }
        Ok(Self::SetPixel {
            index: index as u16,
            color,
        })
    }

    /// Bytes as the firmware expects them: words and colours are little
    /// endian.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Self::Start => vec![1],
            Self::Exit => vec![0, 0],
            Self::Flush => vec![1, 0],
            Self::SetPixel { index, color } => {
                let word = (index as usize + PIXEL_INDEX_OFFSET) as u16;
                let [lo, hi] = word.to_le_bytes();
                let [c0, c1, c2, _] = color.to_le_bytes();
                vec![lo, hi, c0, c1, c2]
            }
        }
    }

    /// Decodes the frame at the front of `bytes`, returning it with the
    /// number of bytes consumed. A lone `1` byte is START; anything else is
    /// read as a 16-bit word.
    pub fn decode(bytes: &[u8]) -> Option<(Self, usize)> {
        match bytes {
            [1] => Some((Self::Start, 1)),
            [0, 0, ..] => Some((Self::Exit, 2)),
            [1, 0, ..] => Some((Self::Flush, 2)),
            [lo, hi, c0, c1, c2, ..] => {
                let word = u16::from_le_bytes([*lo, *hi]) as usize;
                Some((
                    Self::SetPixel {
                        index: (word - PIXEL_INDEX_OFFSET) as u16,
                        color: u32::from_le_bytes([*c0, *c1, *c2, 0]),
                    },
                    5,
                ))
            }
            _ => None,
        }
    }

    /// Decodes a whole session as written to the link: a START byte
    /// followed by word-framed messages.
    pub fn decode_session(bytes: &[u8]) -> Result<Vec<Self>> {
        let mut frames = Vec::new();
        let mut rest = match bytes.split_first() {
            Some((&1, rest)) => {
                frames.push(Self::Start);
                rest
            }
            Some(_) => return Err(BeatlightError::InvalidInput("session must begin with START")),
            None => return Ok(frames),
        };
        while !rest.is_empty() {
            if rest.len() < 2 {
                return Err(BeatlightError::InvalidInput("truncated frame"));
            }
            let (frame, used) = Self::decode(rest)
                .ok_or(BeatlightError::InvalidInput("truncated frame"))?;
            frames.push(frame);
            rest = &rest[used..];
        }
        Ok(frames)
    }
}

/// Byte pipe to the microcontroller.
pub trait PhysicalLink: Send {
    /// Opens the port. Called once per output session.
    fn open(&mut self) -> Result<()>;

    /// Blocking write of the whole buffer.
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Closes the port. Closing a closed link is a no-op.
    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// Serial device opened as a plain file, e.g. `/dev/ttyACM0` with the port
/// already configured by the OS.
#[derive(Debug)]
pub struct SerialLink {
    path: PathBuf,
    file: Option<File>,
}

impl SerialLink {
    /// Link to the device at `path`. Nothing is opened until
    /// [`PhysicalLink::open`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }
}

impl PhysicalLink for SerialLink {
    fn open(&mut self) -> Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        tracing::info!(path = %self.path.display(), "opened serial link");
        self.file = Some(file);
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or(BeatlightError::LinkClosed)?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.file.take().is_some() {
            tracing::info!(path = %self.path.display(), "closed serial link");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

#[derive(Debug, Default)]
struct MemoryLinkState {
    open: bool,
    opens: usize,
    closes: usize,
    failing: bool,
    writes: Vec<Vec<u8>>,
}

/// Link that keeps every write in memory. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct MemoryLink {
    state: Arc<Mutex<MemoryLinkState>>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent writes fail with a broken pipe.
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut state) = self.lock() {
            state.failing = failing;
        }
    }

    /// Every write call, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().map(|state| state.writes.clone()).unwrap_or_default()
    }

    /// All bytes written, concatenated.
    pub fn bytes(&self) -> Vec<u8> {
        self.writes().concat()
    }

    /// Number of successful `open` calls.
    pub fn opens(&self) -> usize {
        self.lock().map(|state| state.opens).unwrap_or_default()
    }

    /// Number of `close` calls that closed an open link.
    pub fn closes(&self) -> usize {
        self.lock().map(|state| state.closes).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryLinkState>> {
        self.state
            .lock()
            .map_err(|_| BeatlightError::msg("memory link has been poisoned"))
    }
}

impl PhysicalLink for MemoryLink {
    fn open(&mut self) -> Result<()> {
        let mut state = self.lock()?;
        state.open = true;
        state.opens += 1;
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.lock()?;
        if !state.open {
            return Err(BeatlightError::LinkClosed);
        }
        if state.failing {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "link unplugged").into());
        }
        state.writes.push(bytes.to_vec());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.lock()?;
        if state.open {
            state.open = false;
            state.closes += 1;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().map(|state| state.open).unwrap_or(false)
    }
}
