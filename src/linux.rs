//! Linux serial port transport.

use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::{Ecbm, Options};

/// Read timeout of the underlying tty, short enough that reads act as polls
const READ_TIMEOUT: Duration = Duration::from_millis(1);

impl Ecbm<Serial, Delay, IoErrorKind> {
    /// Open a serial port as an ECBM bus
    pub fn linux<P: AsRef<Path>>(port: P, baud: usize, options: Options) -> Result<Self, SerialError> {
        let path = port.as_ref();
        debug!("Opening {} at {} baud", path.display(), baud);

        let mut port = Serial::open(path)?;

        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        // Timed out reads surface as WouldBlock
        port.0.set_timeout(READ_TIMEOUT)?;

        Ok(Self::new(port, Delay {}, options))
    }
}
