//! NUT server black-box tests over a localhost socket.

mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use nutups_lib::model::{StatusFlags, UpsData};
use nutups_lib::nut::{NutServer, UpsDataProvider};
use nutups_lib::Config;

const IO_TIMEOUT: Duration = Duration::from_secs(2);

struct StubProvider {
    data: StdMutex<Option<UpsData>>,
    connected: AtomicBool,
    commands: StdMutex<Vec<String>>,
}

impl StubProvider {
    fn stale() -> Self {
        Self {
            data: StdMutex::new(None),
            connected: AtomicBool::new(false),
            commands: StdMutex::new(Vec::new()),
        }
    }

    fn healthy() -> Self {
        let mut data = UpsData::new();
        data.device.manufacturer = "APC".to_string();
        data.device.model = "Back-UPS ES".to_string();
        data.device.serial_number = "AB1234567890".to_string();
        data.power.status_flags = StatusFlags::ONLINE | StatusFlags::CHARGING;
        data.battery.level = 99.0;
        data.battery.runtime_minutes = 615.0;
        data.power.input_voltage = 230.04;
        data.power.load_percent = 7.0;
        Self {
            data: StdMutex::new(Some(data)),
            connected: AtomicBool::new(true),
            commands: StdMutex::new(Vec::new()),
        }
    }

    fn executed_commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpsDataProvider for StubProvider {
    fn snapshot(&self) -> Option<UpsData> {
        self.data.lock().unwrap().clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn instcmd(&self, command: &str) -> bool {
        self.commands.lock().unwrap().push(command.to_string());
        command == "beeper.enable"
    }

    fn available_commands(&self) -> Vec<&'static str> {
        if self.is_connected() {
            vec!["beeper.enable", "beeper.disable", "test.battery.start.quick"]
        } else {
            Vec::new()
        }
    }
}

async fn start_server(
    provider: Arc<StubProvider>,
    password: &str,
    max_clients: u8,
) -> SocketAddr {
    let mut config = Config::default();
    config.nut.password = password.to_string();
    config.nut.max_clients = max_clients;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = NutServer::new(&config, provider as Arc<dyn UpsDataProvider>);
    tokio::spawn(server.serve(listener));
    addr
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = timeout(IO_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("read timed out")
            .expect("read failed");
        assert!(n > 0, "connection closed unexpectedly");
        line
    }

    /// Reads until an `END ` line, inclusive.
    async fn read_block(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let done = line.starts_with("END ");
            lines.push(line.trim_end().to_string());
            if done {
                return lines;
            }
        }
    }

    /// True once the server has closed the connection.
    async fn is_closed(&mut self) -> bool {
        let mut line = String::new();
        matches!(
            timeout(IO_TIMEOUT, self.reader.read_line(&mut line)).await,
            Ok(Ok(0))
        )
    }
}

#[tokio::test]
async fn list_var_while_disconnected_is_data_stale() {
    let addr = start_server(Arc::new(StubProvider::stale()), "", 4).await;
    let mut client = Client::connect(addr).await;

    client.send("LIST VAR ups").await;
    assert_eq!(client.read_line().await, "ERR DATA-STALE\n");
}

#[tokio::test]
async fn login_then_list_ups() {
    let addr = start_server(Arc::new(StubProvider::stale()), "secret", 4).await;
    let mut client = Client::connect(addr).await;

    client.send("LOGIN ups secret").await;
    assert_eq!(client.read_line().await, "OK\n");

    client.send("LIST UPS").await;
    let block = client.read_block().await;
    assert_eq!(
        block,
        vec![
            "BEGIN LIST UPS".to_string(),
            "UPS ups \"ESPHome UPS\"".to_string(),
            "END LIST UPS".to_string(),
        ]
    );
}

#[tokio::test]
async fn three_bad_logins_close_the_socket() {
    let addr = start_server(Arc::new(StubProvider::stale()), "secret", 4).await;
    let mut client = Client::connect(addr).await;

    client.send("LOGIN ups wrong").await;
    assert_eq!(client.read_line().await, "ERR ACCESS-DENIED\n");
    client.send("LOGIN ups wrong").await;
    assert_eq!(client.read_line().await, "ERR ACCESS-DENIED\n");
    client.send("LOGIN ups wrong").await;
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn protected_commands_require_auth() {
    let addr = start_server(Arc::new(StubProvider::healthy()), "secret", 4).await;
    let mut client = Client::connect(addr).await;

    client.send("LIST UPS").await;
    assert_eq!(client.read_line().await, "ERR ACCESS-DENIED\n");

    // The two-message flow authenticates on PASSWORD.
    client.send("USERNAME admin").await;
    assert_eq!(client.read_line().await, "OK\n");
    client.send("PASSWORD secret").await;
    assert_eq!(client.read_line().await, "OK\n");

    client.send("LIST UPS").await;
    let block = client.read_block().await;
    assert_eq!(block[1], "UPS ups \"APC Back-UPS ES\"");
}

#[tokio::test]
async fn list_var_block_is_well_formed() {
    let addr = start_server(Arc::new(StubProvider::healthy()), "", 4).await;
    let mut client = Client::connect(addr).await;

    client.send("LIST VAR ups").await;
    let block = client.read_block().await;

    assert_eq!(block.first().unwrap(), "BEGIN LIST VAR ups");
    assert_eq!(block.last().unwrap(), "END LIST VAR ups");
    for var_line in &block[1..block.len() - 1] {
        assert!(var_line.starts_with("VAR ups "), "bad line {var_line:?}");
        assert!(var_line.ends_with('"'), "unquoted value in {var_line:?}");
    }

    assert!(block.contains(&"VAR ups ups.status \"OL CHRG\"".to_string()));
    assert!(block.contains(&"VAR ups battery.charge \"99\"".to_string()));
    assert!(block.contains(&"VAR ups input.voltage \"230.0\"".to_string()));
    assert!(block.contains(&"VAR ups battery.runtime \"36900\"".to_string()));
    // Unset variables are omitted entirely.
    assert!(!block.iter().any(|l| l.contains("battery.voltage.nominal")));
}

#[tokio::test]
async fn get_var_single_and_unsupported() {
    let addr = start_server(Arc::new(StubProvider::healthy()), "", 4).await;
    let mut client = Client::connect(addr).await;

    client.send("GET VAR ups ups.load").await;
    assert_eq!(client.read_line().await, "VAR ups ups.load \"7\"\n");

    client.send("GET VAR ups input.frequency").await;
    assert_eq!(client.read_line().await, "ERR VAR-NOT-SUPPORTED\n");

    client.send("GET VAR other ups.load").await;
    assert_eq!(client.read_line().await, "ERR UNKNOWN-UPS\n");
}

#[tokio::test]
async fn instcmd_dispatches_and_reports() {
    let provider = Arc::new(StubProvider::healthy());
    let addr = start_server(Arc::clone(&provider), "", 4).await;
    let mut client = Client::connect(addr).await;

    client.send("INSTCMD ups beeper.enable").await;
    assert_eq!(client.read_line().await, "OK\n");

    client.send("INSTCMD ups beeper.frobnicate").await;
    assert_eq!(client.read_line().await, "ERR CMD-NOT-SUPPORTED\n");

    assert_eq!(
        provider.executed_commands(),
        vec!["beeper.enable".to_string(), "beeper.frobnicate".to_string()]
    );
}

#[tokio::test]
async fn instcmd_without_driver_is_refused() {
    let addr = start_server(Arc::new(StubProvider::stale()), "", 4).await;
    let mut client = Client::connect(addr).await;

    client.send("INSTCMD ups beeper.enable").await;
    assert_eq!(client.read_line().await, "ERR DRIVER-NOT-CONNECTED\n");
}

#[tokio::test]
async fn list_cmd_names_supported_commands() {
    let addr = start_server(Arc::new(StubProvider::healthy()), "", 4).await;
    let mut client = Client::connect(addr).await;

    client.send("LIST CMD ups").await;
    let block = client.read_block().await;
    assert_eq!(block.first().unwrap(), "BEGIN LIST CMD ups");
    assert!(block.contains(&"CMD ups beeper.enable".to_string()));
    assert_eq!(block.last().unwrap(), "END LIST CMD ups");
}

#[tokio::test]
async fn slot_exhaustion_rejects_with_max_clients() {
    let addr = start_server(Arc::new(StubProvider::healthy()), "", 1).await;

    let mut first = Client::connect(addr).await;
    first.send("VER").await;
    let _ = first.read_line().await;

    let mut second = Client::connect(addr).await;
    assert_eq!(
        second.read_line().await,
        "ERR MAX-CLIENTS Maximum number of clients reached\n"
    );
}

#[tokio::test]
async fn list_clients_shows_active_slots() {
    let addr = start_server(Arc::new(StubProvider::healthy()), "", 4).await;
    let mut client = Client::connect(addr).await;

    // Make sure the slot registered before asking.
    client.send("VER").await;
    let _ = client.read_line().await;

    client.send("LIST CLIENTS").await;
    let block = client.read_block().await;
    assert_eq!(block.first().unwrap(), "BEGIN LIST CLIENT");
    assert_eq!(block.last().unwrap(), "END LIST CLIENT");
    let clients: Vec<_> = block
        .iter()
        .filter(|l| l.starts_with("CLIENT "))
        .collect();
    assert_eq!(clients.len(), 1);
    assert!(clients[0].starts_with("CLIENT 127.0.0.1 "));
    assert!(clients[0].ends_with("connected"));
}

#[tokio::test]
async fn protocol_small_talk() {
    let addr = start_server(Arc::new(StubProvider::healthy()), "", 4).await;
    let mut client = Client::connect(addr).await;

    client.send("NETVER").await;
    assert_eq!(client.read_line().await, "1.3\n");

    client.send("VER").await;
    let version = client.read_line().await;
    assert!(version.starts_with("VERSION \"nutups "));
    assert!(version.trim_end().ends_with('"'));

    client.send("STARTTLS").await;
    assert_eq!(client.read_line().await, "ERR FEATURE-NOT-SUPPORTED\n");

    client.send("UPSDVER").await;
    assert!(client.read_line().await.starts_with("nutups "));

    client.send("HELP").await;
    assert!(client.read_line().await.starts_with("Commands: "));

    client.send("FSD ups").await;
    assert_eq!(client.read_line().await, "OK FSD-SET\n");

    client.send("FROBNICATE").await;
    assert_eq!(client.read_line().await, "ERR UNKNOWN-COMMAND\n");

    client.send("LOGOUT").await;
    assert_eq!(client.read_line().await, "OK Goodbye\n");
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn legacy_bare_ups_name_lists_variables() {
    let addr = start_server(Arc::new(StubProvider::healthy()), "", 4).await;
    let mut client = Client::connect(addr).await;

    client.send("ups").await;
    let mut lines = Vec::new();
    for _ in 0..8 {
        lines.push(client.read_line().await.trim_end().to_string());
    }
    assert!(lines.contains(&"ups.status".to_string()));
    assert!(lines.contains(&"battery.charge".to_string()));
}

#[tokio::test]
async fn empty_rw_enum_range_blocks() {
    let addr = start_server(Arc::new(StubProvider::healthy()), "", 4).await;
    let mut client = Client::connect(addr).await;

    client.send("LIST RW ups").await;
    assert_eq!(
        client.read_block().await,
        vec!["BEGIN LIST RW ups".to_string(), "END LIST RW ups".to_string()]
    );

    client.send("LIST ENUM ups input.voltage").await;
    assert_eq!(
        client.read_block().await,
        vec![
            "BEGIN LIST ENUM ups input.voltage".to_string(),
            "END LIST ENUM ups input.voltage".to_string(),
        ]
    );

    client.send("SET VAR ups ups.load 5").await;
    assert_eq!(client.read_line().await, "ERR CMD-NOT-SUPPORTED\n");
}
