use thiserror::Error;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Error {
    #[error("Buffer too small")]
    BufferTooSmallError,
    #[error("Timed out waiting for a response")]
    TimeoutError,
    #[error("Channel is closed")]
    ChannelClosedError,
    #[error("UART read failed")]
    UartReadError,
    #[error("UART write failed")]
    UartWriteError,
    #[error("Invalid string encoding")]
    StringEncodingError,
    #[error("Cannot parse string as the given type")]
    ParseError,
    #[error("Configured value was not confirmed by the device")]
    ConfigMismatchError,
}
