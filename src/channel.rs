//! AT command dispatcher over a byte-oriented serial channel.
//!
//! [`AtChannel`] serializes commands against one transport and hands each
//! caller the matching multi-line response. The receive side runs on a
//! background task: [`AtBroker`] owns the [`AtParser`], feeds it every
//! inbound byte and routes the emitted events, responses to the waiting
//! command and unsolicited result codes to [`URC_CHANNEL`]. The physical
//! layer is abstracted away by the [`Tx`] and [`Rx`] traits.
//!
//! The dispatcher and the broker talk through static channels, so exactly
//! one `AtChannel` (and its reader) may exist per firmware image, matching
//! the one-modem-per-channel model.

use core::str::FromStr;
use core::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "defmt")]
use defmt::{debug, warn};
use embassy_executor::Spawner;
use embassy_futures::select::{Either, select};
use embassy_sync::{channel::Channel, signal::Signal};
use embassy_time::{Duration, Instant, WithTimeout};
use heapless::{String, Vec, format};
#[cfg(not(feature = "defmt"))]
use log::{debug, warn};

use crate::RawMutex;
use crate::error::Error;
use crate::parser::{AT_PROMPT_SIZE, AtParser, Event};
use crate::response::{AT_BUF_SIZE, AT_COMMAND_SIZE, AT_LINE_SIZE, AtResponse};
use crate::scan::LineScanner;

/// Command wait cap applied until [`AtChannel::set_timeout`] is called.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// URCs queued but not yet drained by the consumer.
pub const URC_QUEUE_SIZE: usize = 4;

/// A handler invoked on the reader task for every URC line, before the line
/// is queued. Returning `true` consumes the line. Must not block and must
/// not issue commands on the same channel.
pub type UrcHandlerType = fn(&[u8]) -> bool;

/// The queue URCs are delivered through; drain it from a consumer task.
pub type UrcChannelType = Channel<RawMutex, String<AT_LINE_SIZE>, URC_QUEUE_SIZE>;

type ReplyChannelType = Channel<RawMutex, crate::Result<AtResponse>, 2>;

static REPLY_CHANNEL: ReplyChannelType = Channel::new();
pub static URC_CHANNEL: UrcChannelType = Channel::new();
static CONTROL_CHANNEL: Channel<RawMutex, Control, 2> = Channel::new();
static CLOSED: Signal<RawMutex, ()> = Signal::new();
static OPEN: AtomicBool = AtomicBool::new(false);

/// A trait for writing to the serial transport.
pub trait Tx {
    /// Writes the whole buffer to the transport.
    fn write(&mut self, buffer: &[u8]) -> impl core::future::Future<Output = crate::Result<()>>;
}

/// A trait for reading from the serial transport.
pub trait Rx {
    /// Spawns the background reader task driving `broker` with the bytes
    /// this receiver produces. Implementations define their own
    /// `#[embassy_executor::task]` and run [`AtBroker::run`] in it.
    fn spawn(self, spawner: Spawner, broker: AtBroker);

    /// Reads available bytes into `buf`, returning how many arrived.
    /// Returning early with partial data is fine.
    fn read(&mut self, buf: &mut [u8]) -> impl core::future::Future<Output = crate::Result<usize>>;
}

enum Control {
    Arm {
        prompt: Option<String<AT_PROMPT_SIZE>>,
        scanner: Option<LineScanner>,
    },
    Reset,
    Open,
    Close,
    Suspend,
    Resume,
    Shutdown,
}

enum Routed {
    Reply(crate::Result<AtResponse>),
    Urc(String<AT_LINE_SIZE>),
}

/// The receive-side broker: owns the parser, runs on the reader task.
pub struct AtBroker {
    parser: AtParser<AT_BUF_SIZE>,
    urc_handler: Option<UrcHandlerType>,
    open: bool,
    suspended: bool,
}

impl AtBroker {
    fn new(urc_handler: Option<UrcHandlerType>, session_scanner: Option<LineScanner>) -> Self {
        Self {
            parser: AtParser::new(session_scanner),
            urc_handler,
            open: false,
            suspended: false,
        }
    }

    /// Runs the broker loop until shutdown.
    ///
    /// While the channel is closed or suspended only control messages are
    /// served; otherwise control and serial bytes are raced, control first,
    /// so a command is always armed before its response bytes are parsed.
    pub async fn run(mut self, mut rx: impl Rx) {
        let mut buf = [0; AT_BUF_SIZE];
        loop {
            if !self.open || self.suspended {
                let control = CONTROL_CHANNEL.receive().await;
                if self.apply(control) {
                    break;
                }
                continue;
            }
            match select(CONTROL_CHANNEL.receive(), rx.read(&mut buf)).await {
                Either::First(control) => {
                    if self.apply(control) {
                        break;
                    }
                }
                Either::Second(Ok(len)) => self.ingest(&buf[..len]).await,
                Either::Second(Err(err)) => REPLY_CHANNEL.send(Err(err)).await,
            }
        }
    }

    fn apply(&mut self, control: Control) -> bool {
        match control {
            Control::Arm { prompt, scanner } => match prompt {
                Some(prompt) => self.parser.expect_prompt(prompt, scanner),
                None => self.parser.expect_response(scanner),
            },
            Control::Reset => self.parser.reset(),
            Control::Open => self.open = true,
            Control::Close => {
                self.open = false;
                self.parser.reset();
            }
            Control::Suspend => self.suspended = true,
            Control::Resume => self.suspended = false,
            Control::Shutdown => return true,
        }
        false
    }

    async fn ingest(&mut self, data: &[u8]) {
        for &ch in data {
            let routed = match self.parser.feed_byte(ch) {
                None => continue,
                Some(Event::Response(body)) => Routed::Reply(Ok(AtResponse::from_body(body))),
                Some(Event::Urc(line)) => {
                    if let Some(handler) = self.urc_handler
                        && handler(line)
                    {
                        continue;
                    }
                    match core::str::from_utf8(line).ok().and_then(|line| String::from_str(line).ok())
                    {
                        Some(line) => Routed::Urc(line),
                        None => {
                            warn!("Dropping unrepresentable URC line");
                            continue;
                        }
                    }
                }
            };
            match routed {
                Routed::Reply(reply) => REPLY_CHANNEL.send(reply).await,
                Routed::Urc(line) => {
                    if URC_CHANNEL.try_send(line).is_err() {
                        warn!("URC queue full, dropping line");
                    }
                }
            }
        }
    }
}

/// An AT command channel over a serial transport.
///
/// The TX half is owned directly; the RX half is handed to the reader task
/// by [`AtChannel::spawn_rx`]. One command may be outstanding at a time,
/// which `&mut self` on [`AtChannel::command`] enforces.
pub struct AtChannel<T: Tx, R: Rx> {
    tx: T,
    rx: Option<R>,
    timeout: Duration,
    command_scanner: Option<LineScanner>,
    dataprompt: Option<String<AT_PROMPT_SIZE>>,
}

impl<T: Tx, R: Rx> AtChannel<T, R> {
    pub fn new(tx: T, rx: R) -> Self {
        Self {
            tx,
            rx: Some(rx),
            timeout: DEFAULT_TIMEOUT,
            command_scanner: None,
            dataprompt: None,
        }
    }

    /// Spawns the reader task that parses inbound bytes and brokers them.
    ///
    /// # Arguments
    /// * `urc_handler` - An inline filter for URC lines, called on the
    ///   reader task before the line is queued on [`URC_CHANNEL`].
    /// * `session_scanner` - A session-wide line classifier consulted after
    ///   the per-command one and before the built-in tables.
    /// * `spawner` - The task spawner.
    pub fn spawn_rx(
        &mut self,
        urc_handler: Option<UrcHandlerType>,
        session_scanner: Option<LineScanner>,
        spawner: Spawner,
    ) {
        let broker = AtBroker::new(urc_handler, session_scanner);
        // Consume self.rx, then set self.rx = None
        let rx = self.rx.take();
        rx.unwrap().spawn(spawner, broker);
    }

    /// Enables the channel. Stale replies and a stale close notification
    /// from a previous open/close cycle are drained first.
    pub async fn open(&mut self) {
        while REPLY_CHANNEL.try_receive().is_ok() {}
        CLOSED.reset();
        OPEN.store(true, Ordering::Relaxed);
        CONTROL_CHANNEL.send(Control::Open).await;
    }

    /// Disables the channel. An in-flight command observes the closure and
    /// returns [`Error::ChannelClosedError`].
    pub async fn close(&mut self) {
        OPEN.store(false, Ordering::Relaxed);
        CONTROL_CHANNEL.send(Control::Close).await;
        CLOSED.signal(());
    }

    /// Pauses the reader task; inbound bytes stay in the transport.
    pub async fn suspend(&mut self) {
        CONTROL_CHANNEL.send(Control::Suspend).await;
    }

    /// Resumes a suspended reader task.
    pub async fn resume(&mut self) {
        CONTROL_CHANNEL.send(Control::Resume).await;
    }

    /// Closes the channel and terminates the reader task.
    pub async fn shutdown(mut self) {
        self.close().await;
        CONTROL_CHANNEL.send(Control::Shutdown).await;
    }

    /// Sets the cap on how long [`AtChannel::command`] waits.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Installs a line classifier for the next command only.
    pub fn set_command_scanner(&mut self, scanner: LineScanner) {
        self.command_scanner = Some(scanner);
    }

    /// Makes the next command accept `prompt` (typically
    /// [`crate::parser::DATA_PROMPT`]) as a response terminator, without a
    /// line ending.
    pub fn expect_dataprompt(&mut self, prompt: &str) -> crate::Result<()> {
        self.dataprompt = Some(String::from_str(prompt).map_err(|_| Error::BufferTooSmallError)?);
        Ok(())
    }

    /// Sends a command with a trailing CR appended and waits for the
    /// response.
    pub async fn command(&mut self, command: &str) -> crate::Result<AtResponse> {
        let start = Instant::now();
        let message =
            format!(AT_COMMAND_SIZE; "{command}\r").map_err(|_| Error::BufferTooSmallError)?;
        let response = self.command_raw(message.as_bytes()).await?;
        debug!(
            "{}: {}, took {}ms",
            command,
            response,
            (Instant::now() - start).as_millis()
        );
        Ok(response)
    }

    /// Sends raw bytes as a command, with no formatting and no CR appended,
    /// and waits for the response. This is also the second half of a
    /// data-prompt exchange: the payload goes out through `command_raw` and
    /// the final confirmation comes back as its response.
    pub async fn command_raw(&mut self, message: &[u8]) -> crate::Result<AtResponse> {
        if !OPEN.load(Ordering::Relaxed) {
            return Err(Error::ChannelClosedError);
        }
        let scanner = self.command_scanner.take();
        let prompt = self.dataprompt.take();
        while REPLY_CHANNEL.try_receive().is_ok() {}
        CONTROL_CHANNEL.send(Control::Arm { prompt, scanner }).await;
        self.tx.write(message).await.map_err(|_| Error::UartWriteError)?;

        let deadline = Instant::now() + self.timeout;
        match select(REPLY_CHANNEL.receive(), CLOSED.wait()).with_deadline(deadline).await {
            Ok(Either::First(reply)) => reply,
            Ok(Either::Second(())) => Err(Error::ChannelClosedError),
            Err(_) => {
                // Abandon the partial response; anything the device still
                // sends surfaces through the URC path.
                CONTROL_CHANNEL.send(Control::Reset).await;
                Err(Error::TimeoutError)
            }
        }
    }

    /// Writes a string to the transport without engaging the parser.
    pub async fn send(&mut self, message: &str) -> crate::Result<()> {
        self.send_raw(message.as_bytes()).await
    }

    /// Writes raw bytes to the transport without engaging the parser.
    pub async fn send_raw(&mut self, message: &[u8]) -> crate::Result<()> {
        if !OPEN.load(Ordering::Relaxed) {
            return Err(Error::ChannelClosedError);
        }
        self.tx.write(message).await.map_err(|_| Error::UartWriteError)
    }

    /// Writes bytes hex-encoded, uppercase, high nibble first, chunked
    /// through the command-sized scratch.
    pub async fn send_hex(&mut self, data: &[u8]) -> crate::Result<()> {
        const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";
        for chunk in data.chunks(AT_COMMAND_SIZE / 2) {
            let mut scratch = Vec::<u8, AT_COMMAND_SIZE>::new();
            for &byte in chunk {
                let pair = [
                    HEX_DIGITS[(byte >> 4) as usize],
                    HEX_DIGITS[(byte & 0x0f) as usize],
                ];
                scratch.extend_from_slice(&pair).map_err(|_| Error::BufferTooSmallError)?;
            }
            self.send_raw(&scratch).await?;
        }
        Ok(())
    }

    /// Sets `AT+{option}={value}` and verifies it back with
    /// `AT+{option}?`, retrying up to `attempts` times.
    ///
    /// Returns `Ok(())` only when the device echoed the value back;
    /// exhausting the attempts without a confirmation is
    /// [`Error::ConfigMismatchError`].
    pub async fn config(&mut self, option: &str, value: &str, attempts: usize) -> crate::Result<()> {
        let set = format!(AT_COMMAND_SIZE; "AT+{option}={value}")
            .map_err(|_| Error::BufferTooSmallError)?;
        let query =
            format!(AT_COMMAND_SIZE; "AT+{option}?").map_err(|_| Error::BufferTooSmallError)?;
        for attempt in 0..attempts {
            if attempt > 0 {
                debug!("Retrying configuration of +{}", option);
            }
            let _ = self.command(&set).await?;
            let reply = self.command(&query).await?;
            if let Some(response) = reply.command_response(option)
                && response.rest() == value
            {
                return Ok(());
            }
        }
        Err(Error::ConfigMismatchError)
    }
}
