use atport::RawMutex;
use atport::channel::{AtBroker, AtChannel, Rx, Tx, URC_CHANNEL};
use atport::error::Error;
use atport::parser::DATA_PROMPT;
use atport::response::AT_COMMAND_SIZE;
use atport::scan::LineKind;
use embassy_executor::{Executor, Spawner};
use embassy_sync::channel::Channel;
use embassy_time::Duration;
use heapless::String;
use static_cell::StaticCell;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

type TxChannelType = Channel<RawMutex, String<AT_COMMAND_SIZE>, 5>;
static TX_CHANNEL: TxChannelType = Channel::new();

/// Scripted serial endpoint: asserts every outbound command and replays the
/// canned device bytes. A `None` reply swallows the write, simulating a
/// mute device.
struct FakeSerialRx {
    script: Vec<(&'static str, Option<&'static str>)>,
}

impl FakeSerialRx {
    fn new(script: Vec<(&'static str, Option<&'static str>)>) -> Self {
        Self { script }
    }
}

#[embassy_executor::task]
async fn reader(rx: FakeSerialRx, broker: AtBroker) {
    broker.run(rx).await;
}

impl Rx for FakeSerialRx {
    fn spawn(self, spawner: Spawner, broker: AtBroker) {
        spawner.spawn(reader(self, broker).expect("failed to spawn reader task"));
    }

    async fn read(&mut self, buf: &mut [u8]) -> atport::Result<usize> {
        loop {
            let sent = TX_CHANNEL.receive().await;
            if self.script.is_empty() {
                core::future::pending::<()>().await;
            }
            let (expected, reply) = self.script.remove(0);
            assert_eq!(expected, sent.as_str());
            match reply {
                Some(reply) => {
                    let bytes = reply.as_bytes();
                    buf[..bytes.len()].clone_from_slice(bytes);
                    return Ok(bytes.len());
                }
                None => continue,
            }
        }
    }
}

struct FakeSerialTx {
    channel: &'static TxChannelType,
}

impl Tx for FakeSerialTx {
    async fn write(&mut self, buffer: &[u8]) -> atport::Result<()> {
        let s = core::str::from_utf8(buffer).map_err(|_| Error::StringEncodingError)?;
        let s = String::from_str(s).map_err(|_| Error::BufferTooSmallError)?;
        self.channel.send(s).await;
        Ok(())
    }
}

static RINGS: AtomicUsize = AtomicUsize::new(0);

/// Marks maintenance reports as URCs so they never pollute a response.
fn session_scanner(line: &[u8]) -> Option<LineKind> {
    line.starts_with(b"+EAT:").then_some(LineKind::Urc)
}

fn urc_handler(line: &[u8]) -> bool {
    if line == b"RING" {
        RINGS.fetch_add(1, Ordering::Relaxed);
    }
    // Consume maintenance reports, let everything else reach the queue.
    line.starts_with(b"+EAT:")
}

fn data_scanner(line: &[u8]) -> Option<LineKind> {
    let text = core::str::from_utf8(line).ok()?;
    let rest = text.strip_prefix("+DATA,")?;
    Some(LineKind::RawDataFollows(rest.parse().ok()?))
}

static EXECUTOR: StaticCell<Executor> = StaticCell::new();

#[test]
fn channel_test() {
    env_logger::init();
    let executor = EXECUTOR.init(Executor::new());
    executor.run(|spawner| {
        spawner.spawn(main(spawner).expect("failed to spawn main task"));
    });
}

#[embassy_executor::task]
async fn main(spawner: Spawner) {
    let rx = FakeSerialRx::new(vec![
        ("AT\r", Some("OK\r\n")),
        ("ATI\r", Some("Scripted device r1\r\nOK\r\n")),
        ("AT+CSQ\r", Some("RING\r\n+EAT: 1\r\n+CSQ: 21,0\r\nOK\r\n")),
        ("AT+FAIL\r", Some("+CME ERROR: 100\r\n")),
        ("AT+CFUN=1\r", Some("OK\r\n")),
        ("AT+CFUN?\r", Some("+CFUN: 1\r\nOK\r\n")),
        ("AT+CFUN=5\r", Some("OK\r\n")),
        ("AT+CFUN?\r", Some("+CFUN: 1\r\nOK\r\n")),
        ("AT+CMGS=\"123\"\r", Some("> ")),
        ("hello\x1a", Some("+CMGS: 5\r\nOK\r\n")),
        ("AT+READ\r", Some("+DATA,6\r\nabc\r\ndOK\r\n")),
        ("DEADBEEF", None),
        ("AT+SLOW\r", None),
        ("AT\r", Some("OK\r\n")),
        ("ATE0\r", Some("OK\r\n")),
        ("AT\r", Some("OK\r\n")),
    ]);
    let tx = FakeSerialTx {
        channel: &TX_CHANNEL,
    };
    let mut channel = AtChannel::new(tx, rx);
    channel.spawn_rx(Some(urc_handler), Some(session_scanner), spawner);
    channel.open().await;

    // Bare confirmation: empty body.
    let reply = channel.command("AT").await.unwrap();
    assert!(reply.is_empty());

    // Intermediate line delivered without the final OK.
    let reply = channel.command("ATI").await.unwrap();
    assert_eq!(reply.as_str().unwrap(), "Scripted device r1");

    // URCs interleaved with a response: handler sees both, the queue only
    // gets the unconsumed one, the response stays clean.
    let reply = channel.command("AT+CSQ").await.unwrap();
    assert_eq!(reply.as_str().unwrap(), "+CSQ: 21,0");
    assert_eq!(URC_CHANNEL.receive().await, "RING");
    assert_eq!(URC_CHANNEL.len(), 0);
    assert_eq!(RINGS.load(Ordering::Relaxed), 1);

    // An error final is the body, not an empty reply.
    let reply = channel.command("AT+FAIL").await.unwrap();
    assert_eq!(reply.as_str().unwrap(), "+CME ERROR: 100");

    // Set-and-verify: confirmed, then rejected by the echo check.
    channel.config("CFUN", "1", 3).await.unwrap();
    assert_eq!(
        channel.config("CFUN", "5", 1).await,
        Err(Error::ConfigMismatchError)
    );

    // Data prompt exchange: the prompt terminates the first response, the
    // payload goes out raw and the confirmation comes back for it.
    channel.expect_dataprompt(DATA_PROMPT).unwrap();
    let reply = channel.command_raw(b"AT+CMGS=\"123\"\r").await.unwrap();
    assert_eq!(reply.as_str().unwrap(), "> ");
    let reply = channel.command_raw(b"hello\x1a").await.unwrap();
    assert_eq!(reply.as_str().unwrap(), "+CMGS: 5");

    // A per-command scanner switches the parser into raw capture.
    channel.set_command_scanner(data_scanner);
    let reply = channel.command("AT+READ").await.unwrap();
    assert_eq!(reply.as_bytes(), b"+DATA,6\nabc\r\nd\n".as_slice());

    // Fire-and-forget hex emission, uppercase pairs.
    channel.send_hex(&[0xde, 0xad, 0xbe, 0xef]).await.unwrap();

    // An over-long command fails before touching the transport.
    let long = "A".repeat(AT_COMMAND_SIZE);
    assert_eq!(
        channel.command(&long).await,
        Err(Error::BufferTooSmallError)
    );

    // Timeout: the mute device never answers; the next command finds a
    // freshly reset parser.
    channel.set_timeout(Duration::from_millis(50));
    assert_eq!(channel.command("AT+SLOW").await, Err(Error::TimeoutError));
    channel.set_timeout(Duration::from_secs(5));
    let reply = channel.command("AT").await.unwrap();
    assert!(reply.is_empty());

    // Suspend parks the reader; resuming picks commands back up.
    channel.suspend().await;
    channel.resume().await;
    channel.command("ATE0").await.unwrap();

    // Closed channels fail fast; reopening restores service.
    channel.close().await;
    assert_eq!(channel.command("AT").await, Err(Error::ChannelClosedError));
    channel.open().await;
    channel.command("AT").await.unwrap();

    // The executor has no return path; exit once everything passed.
    std::process::exit(0);
}
