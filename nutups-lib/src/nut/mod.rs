//! NUT-compatible TCP server (network protocol 1.3).
//!
//! One server task owns the listener and a fixed table of client slots,
//! servicing them round-robin on a 10 ms tick with non-blocking reads and
//! single-write replies. NUT clients drive the exchange; no greeting is
//! sent on connect.

pub mod vars;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::UpsError;
use crate::model::UpsData;

/// NUT network protocol version answered by `NETVER`.
pub const NUT_PROTOCOL_VERSION: &str = "1.3";

/// Longest accepted command line, bytes.
pub const MAX_COMMAND_LENGTH: usize = 256;

/// Idle clients beyond this are disconnected.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

pub const MAX_LOGIN_ATTEMPTS: u8 = 3;

/// Round-robin service tick.
const TICK: Duration = Duration::from_millis(10);

const HELP_LINE: &str = "Commands: HELP VERSION NETVER STARTTLS USERNAME PASSWORD LOGIN LOGOUT \
                         LIST GET SET INSTCMD FSD UPSDVER\n";

/// Server identity, used by `VERSION` and `UPSDVER`.
pub fn server_version() -> String {
    format!("nutups {}", env!("CARGO_PKG_VERSION"))
}

/// What the server needs from the UPS core: snapshots, connectivity, and
/// instant-command dispatch.
#[async_trait]
pub trait UpsDataProvider: Send + Sync {
    /// By-value copy of the current data, `None` when nothing valid has
    /// been read yet (drives `ERR DATA-STALE`).
    fn snapshot(&self) -> Option<UpsData>;

    fn is_connected(&self) -> bool;

    /// Executes a NUT instant command ("beeper.enable", ...). False means
    /// unsupported or refused.
    async fn instcmd(&self, command: &str) -> bool;

    /// Instant-command names currently supported.
    fn available_commands(&self) -> Vec<&'static str>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Disconnected,
    Connected,
    Authenticated,
}

struct ClientSlot {
    stream: Option<TcpStream>,
    state: ClientState,
    remote_ip: String,
    connect_time: Instant,
    last_activity: Instant,
    login_attempts: u8,
    username: String,
    temp_username: String,
    temp_password: String,
    line_buf: Vec<u8>,
}

impl ClientSlot {
    fn new() -> Self {
        Self {
            stream: None,
            state: ClientState::Disconnected,
            remote_ip: String::new(),
            connect_time: Instant::now(),
            last_activity: Instant::now(),
            login_attempts: 0,
            username: String::new(),
            temp_username: String::new(),
            temp_password: String::new(),
            line_buf: Vec::new(),
        }
    }

    fn is_active(&self) -> bool {
        self.stream.is_some() && self.state != ClientState::Disconnected
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            ClientState::Authenticated => "authenticated",
            _ => "connected",
        }
    }
}

/// The NUT TCP server. `run` binds on the configured port; `serve` takes
/// a pre-bound listener (tests bind on an ephemeral port).
pub struct NutServer {
    ups_name: String,
    ups_description: String,
    username: String,
    password: String,
    port: u16,
    max_clients: usize,
    provider: Arc<dyn UpsDataProvider>,
}

impl NutServer {
    pub fn new(config: &Config, provider: Arc<dyn UpsDataProvider>) -> Self {
        Self {
            ups_name: config.ups.name.clone(),
            ups_description: config.ups.description.clone(),
            username: config.nut.username.clone(),
            password: config.nut.password.clone(),
            port: config.nut.port,
            max_clients: config.nut.max_clients as usize,
            provider,
        }
    }

    pub async fn run(self) -> Result<(), UpsError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port)).await?;
        info!("NUT server listening on port {}", self.port);
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), UpsError> {
        let mut slots: Vec<ClientSlot> = (0..self.max_clients).map(|_| ClientSlot::new()).collect();
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.accept_client(&mut slots, stream, addr.ip().to_string()),
                    Err(e) => warn!("accept failed: {e}"),
                },
                _ = tick.tick() => {
                    self.service_slots(&mut slots).await;
                    cleanup_idle(&mut slots);
                }
            }
        }
    }

    fn accept_client(&self, slots: &mut [ClientSlot], stream: TcpStream, remote_ip: String) {
        for slot in slots.iter_mut() {
            if !slot.is_active() {
                debug!("client connected from {remote_ip}");
                let now = Instant::now();
                slot.reset();
                slot.stream = Some(stream);
                slot.state = ClientState::Connected;
                slot.remote_ip = remote_ip;
                slot.connect_time = now;
                slot.last_activity = now;
                // No greeting; NUT clients speak first.
                return;
            }
        }

        warn!("maximum clients reached, rejecting {remote_ip}");
        let _ = stream.try_write(b"ERR MAX-CLIENTS Maximum number of clients reached\n");
    }

    async fn service_slots(&self, slots: &mut Vec<ClientSlot>) {
        for idx in 0..slots.len() {
            if !slots[idx].is_active() {
                continue;
            }
            let lines = match read_pending_lines(&mut slots[idx]) {
                Ok(lines) => lines,
                Err(()) => {
                    slots[idx].reset();
                    continue;
                }
            };
            for line in lines {
                self.handle_command(slots, idx, &line).await;
                if !slots[idx].is_active() {
                    break;
                }
            }
        }
    }

    fn authenticate(&self, username: &str, password: &str) -> bool {
        if self.password.is_empty() {
            return true;
        }
        if !self.username.is_empty() && username != self.username {
            return false;
        }
        password == self.password
    }

    fn requires_auth(&self, slot: &ClientSlot) -> bool {
        !self.password.is_empty() && slot.state != ClientState::Authenticated
    }

    async fn handle_command(&self, slots: &mut Vec<ClientSlot>, idx: usize, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let (cmd, args) = split_token(line);
        let cmd_upper = cmd.to_ascii_uppercase();
        debug!("command {cmd_upper:?} args {args:?}");

        match cmd_upper.as_str() {
            "HELP" => {
                send(&mut slots[idx], HELP_LINE);
            }
            "VER" | "VERSION" => {
                send(&mut slots[idx], &format!("VERSION \"{}\"\n", server_version()));
            }
            "NETVER" => {
                send(&mut slots[idx], &format!("{NUT_PROTOCOL_VERSION}\n"));
            }
            "UPSDVER" => {
                send(&mut slots[idx], &format!("{}\n", server_version()));
            }
            "STARTTLS" => {
                send_error(&mut slots[idx], "FEATURE-NOT-SUPPORTED");
            }
            "USERNAME" => self.handle_username(&mut slots[idx], args),
            "PASSWORD" => self.handle_password(&mut slots[idx], args),
            "LOGIN" => self.handle_login(&mut slots[idx], args),
            "LOGOUT" => {
                send(&mut slots[idx], "OK Goodbye\n");
                slots[idx].reset();
            }
            _ => {
                if self.requires_auth(&slots[idx]) {
                    send_error(&mut slots[idx], "ACCESS-DENIED");
                    return;
                }
                self.handle_authenticated(slots, idx, &cmd_upper, cmd, args)
                    .await;
            }
        }
    }

    async fn handle_authenticated(
        &self,
        slots: &mut Vec<ClientSlot>,
        idx: usize,
        cmd_upper: &str,
        cmd_raw: &str,
        args: &str,
    ) {
        match cmd_upper {
            "LIST" => {
                let (sub, sub_args) = split_token(args);
                match sub.to_ascii_uppercase().as_str() {
                    "UPS" => self.handle_list_ups(&mut slots[idx]),
                    "VAR" => self.handle_list_var(&mut slots[idx], sub_args),
                    "CMD" => self.handle_list_cmd(&mut slots[idx], sub_args),
                    "CLIENTS" => self.handle_list_clients(slots, idx),
                    "RW" => self.handle_list_empty_block(&mut slots[idx], "RW", sub_args),
                    "ENUM" => self.handle_list_var_block(&mut slots[idx], "ENUM", sub_args),
                    "RANGE" => self.handle_list_var_block(&mut slots[idx], "RANGE", sub_args),
                    _ => send_error(&mut slots[idx], "INVALID-ARGUMENT"),
                }
            }
            "GET" => {
                let (sub, sub_args) = split_token(args);
                if sub.eq_ignore_ascii_case("VAR") {
                    self.handle_get_var(&mut slots[idx], sub_args);
                } else {
                    send_error(&mut slots[idx], "INVALID-ARGUMENT");
                }
            }
            "SET" => {
                let (sub, _) = split_token(args);
                if sub.eq_ignore_ascii_case("VAR") {
                    send_error(&mut slots[idx], "CMD-NOT-SUPPORTED");
                } else {
                    send_error(&mut slots[idx], "INVALID-ARGUMENT");
                }
            }
            "INSTCMD" => self.handle_instcmd(&mut slots[idx], args).await,
            "FSD" => {
                // Acknowledged, never acted upon: downstream shutdown
                // orchestration is not this server's business.
                warn!("FSD received from {}", slots[idx].remote_ip);
                send(&mut slots[idx], "OK FSD-SET\n");
            }
            _ => {
                // Bare UPS name: legacy `upsc -l` variable listing.
                // UPS names match case-sensitively.
                if cmd_raw == self.ups_name {
                    self.handle_legacy_list(&mut slots[idx]);
                } else {
                    warn!("unknown command {cmd_upper:?}");
                    send_error(&mut slots[idx], "UNKNOWN-COMMAND");
                }
            }
        }
    }

    fn handle_username(&self, slot: &mut ClientSlot, args: &str) {
        if args.is_empty() {
            send_error(slot, "INVALID-ARGUMENT");
            return;
        }
        slot.temp_username = args.to_string();
        send(slot, "OK\n");
    }

    fn handle_password(&self, slot: &mut ClientSlot, args: &str) {
        if args.is_empty() {
            send_error(slot, "INVALID-ARGUMENT");
            return;
        }
        slot.temp_password = args.to_string();

        let ok = self.authenticate(&slot.temp_username.clone(), &slot.temp_password.clone());
        slot.temp_username.clear();
        slot.temp_password.clear();

        if ok {
            slot.state = ClientState::Authenticated;
            slot.login_attempts = 0;
            info!("client {} authenticated", slot.remote_ip);
            send(slot, "OK\n");
        } else {
            slot.login_attempts += 1;
            if slot.login_attempts >= MAX_LOGIN_ATTEMPTS {
                warn!("max login attempts exceeded, disconnecting {}", slot.remote_ip);
                slot.reset();
            } else {
                send_error(slot, "ACCESS-DENIED");
            }
        }
    }

    fn handle_login(&self, slot: &mut ClientSlot, args: &str) {
        if slot.state == ClientState::Authenticated {
            // Repeated logins are tolerated, but still count.
            slot.login_attempts += 1;
            if slot.login_attempts >= MAX_LOGIN_ATTEMPTS {
                warn!("max login attempts exceeded, disconnecting {}", slot.remote_ip);
                slot.reset();
                return;
            }
            send(slot, "OK\n");
            return;
        }

        let parts: Vec<&str> = args.split_whitespace().collect();
        if parts.len() != 2 {
            send_error(slot, "INVALID-ARGUMENT");
            return;
        }

        if self.authenticate(parts[0], parts[1]) {
            slot.state = ClientState::Authenticated;
            slot.username = parts[0].to_string();
            debug!("client authenticated as {}", parts[0]);
            send(slot, "OK\n");
        } else {
            slot.login_attempts += 1;
            if slot.login_attempts >= MAX_LOGIN_ATTEMPTS {
                warn!("max login attempts exceeded, disconnecting {}", slot.remote_ip);
                slot.reset();
            } else {
                send_error(slot, "ACCESS-DENIED");
            }
        }
    }

    fn handle_list_ups(&self, slot: &mut ClientSlot) {
        let description = self.describe_ups();
        let response = format!(
            "BEGIN LIST UPS\nUPS {} \"{}\"\nEND LIST UPS\n",
            self.ups_name, description
        );
        send(slot, &response);
    }

    fn describe_ups(&self) -> String {
        if let Some(data) = self.provider.snapshot() {
            let mfr = data.device.manufacturer;
            let model = data.device.model;
            if !mfr.is_empty() && !model.is_empty() {
                return format!("{mfr} {model}");
            }
            if !mfr.is_empty() {
                return mfr;
            }
        }
        self.ups_description.clone()
    }

    fn handle_list_var(&self, slot: &mut ClientSlot, args: &str) {
        if args != self.ups_name {
            send_error(slot, "UNKNOWN-UPS");
            return;
        }
        let Some(data) = self.provider.snapshot() else {
            send_error(slot, "DATA-STALE");
            return;
        };

        let mut response = format!("BEGIN LIST VAR {}\n", self.ups_name);
        for name in vars::LIST_VAR_ORDER {
            if let Some(value) = vars::lookup(&data, name) {
                response.push_str(&format!("VAR {} {} \"{}\"\n", self.ups_name, name, value));
            }
        }
        response.push_str(&format!("END LIST VAR {}\n", self.ups_name));
        send(slot, &response);
    }

    fn handle_get_var(&self, slot: &mut ClientSlot, args: &str) {
        let parts: Vec<&str> = args.split_whitespace().collect();
        if parts.len() != 2 {
            send_error(slot, "INVALID-ARGUMENT");
            return;
        }
        if parts[0] != self.ups_name {
            send_error(slot, "UNKNOWN-UPS");
            return;
        }
        let Some(data) = self.provider.snapshot() else {
            send_error(slot, "DATA-STALE");
            return;
        };
        match vars::lookup(&data, parts[1]) {
            Some(value) => send(
                slot,
                &format!("VAR {} {} \"{}\"\n", self.ups_name, parts[1], value),
            ),
            None => send_error(slot, "VAR-NOT-SUPPORTED"),
        }
    }

    fn handle_list_cmd(&self, slot: &mut ClientSlot, args: &str) {
        if args != self.ups_name {
            send_error(slot, "UNKNOWN-UPS");
            return;
        }
        let mut response = format!("BEGIN LIST CMD {}\n", self.ups_name);
        for command in self.provider.available_commands() {
            response.push_str(&format!("CMD {} {}\n", self.ups_name, command));
        }
        response.push_str(&format!("END LIST CMD {}\n", self.ups_name));
        send(slot, &response);
    }

    fn handle_list_clients(&self, slots: &mut [ClientSlot], idx: usize) {
        let now = Instant::now();
        let mut response = String::from("BEGIN LIST CLIENT\n");
        for slot in slots.iter() {
            if slot.is_active() {
                response.push_str(&format!(
                    "CLIENT {} {} {}\n",
                    slot.remote_ip,
                    now.duration_since(slot.connect_time).as_secs(),
                    slot.state_name()
                ));
            }
        }
        response.push_str("END LIST CLIENT\n");
        send(&mut slots[idx], &response);
    }

    /// `LIST RW <ups>`: nothing is writable, but the block must be
    /// well-formed.
    fn handle_list_empty_block(&self, slot: &mut ClientSlot, kind: &str, args: &str) {
        if args != self.ups_name {
            send_error(slot, "UNKNOWN-UPS");
            return;
        }
        send(
            slot,
            &format!(
                "BEGIN LIST {kind} {0}\nEND LIST {kind} {0}\n",
                self.ups_name
            ),
        );
    }

    /// `LIST ENUM/RANGE <ups> <var>`: likewise empty but well-formed.
    fn handle_list_var_block(&self, slot: &mut ClientSlot, kind: &str, args: &str) {
        let parts: Vec<&str> = args.split_whitespace().collect();
        if parts.len() != 2 || parts[0] != self.ups_name {
            send_error(slot, "INVALID-ARGUMENT");
            return;
        }
        send(
            slot,
            &format!(
                "BEGIN LIST {kind} {0} {1}\nEND LIST {kind} {0} {1}\n",
                self.ups_name, parts[1]
            ),
        );
    }

    async fn handle_instcmd(&self, slot: &mut ClientSlot, args: &str) {
        let parts: Vec<&str> = args.split_whitespace().collect();
        if parts.len() != 2 {
            send_error(slot, "INVALID-ARGUMENT");
            return;
        }
        if parts[0] != self.ups_name {
            send_error(slot, "UNKNOWN-UPS");
            return;
        }
        if !self.provider.is_connected() {
            send_error(slot, "DRIVER-NOT-CONNECTED");
            return;
        }
        if self.provider.instcmd(parts[1]).await {
            send(slot, "OK\n");
        } else {
            warn!("instant command failed or unsupported: {}", parts[1]);
            send_error(slot, "CMD-NOT-SUPPORTED");
        }
    }

    fn handle_legacy_list(&self, slot: &mut ClientSlot) {
        let Some(_) = self.provider.snapshot() else {
            send_error(slot, "DATA-STALE");
            return;
        };
        let mut response = String::new();
        for name in vars::LEGACY_VAR_NAMES {
            response.push_str(name);
            response.push('\n');
        }
        send(slot, &response);
    }
}

/// First whitespace-delimited token and the rest.
fn split_token(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, tail.trim_start()),
        None => (line, ""),
    }
}

/// Drains complete `\n`-terminated lines from the slot's socket without
/// blocking. `Err` means the peer is gone.
fn read_pending_lines(slot: &mut ClientSlot) -> Result<Vec<String>, ()> {
    let Some(stream) = slot.stream.as_ref() else {
        return Err(());
    };

    let mut buf = [0u8; 512];
    loop {
        match stream.try_read(&mut buf) {
            Ok(0) => {
                debug!("client {} disconnected", slot.remote_ip);
                return Err(());
            }
            Ok(n) => {
                slot.line_buf.extend_from_slice(&buf[..n]);
                if slot.line_buf.len() > MAX_COMMAND_LENGTH && !slot.line_buf.contains(&b'\n') {
                    debug!("oversized command line from {}", slot.remote_ip);
                    return Err(());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                // Reset/pipe errors are routine client behavior.
                debug!("read error from {}: {e}", slot.remote_ip);
                return Err(());
            }
        }
    }

    let mut lines = Vec::new();
    while let Some(pos) = slot.line_buf.iter().position(|&b| b == b'\n') {
        let mut raw: Vec<u8> = slot.line_buf.drain(..=pos).collect();
        raw.pop(); // the newline
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        slot.last_activity = Instant::now();
        lines.push(String::from_utf8_lossy(&raw).into_owned());
    }
    Ok(lines)
}

/// One-write reply. A peer that cannot take the whole reply at once is
/// considered dead and the slot is torn down.
fn send(slot: &mut ClientSlot, response: &str) {
    let Some(stream) = slot.stream.as_ref() else {
        return;
    };
    match stream.try_write(response.as_bytes()) {
        Ok(n) if n == response.len() => {}
        Ok(_) => {
            debug!("partial write to {}, dropping client", slot.remote_ip);
            slot.reset();
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            debug!("write would block for {}, dropping client", slot.remote_ip);
            slot.reset();
        }
        Err(e) => {
            debug!("write error to {}: {e}", slot.remote_ip);
            slot.reset();
        }
    }
}

fn send_error(slot: &mut ClientSlot, code: &str) {
    send(slot, &format!("ERR {code}\n"));
}

fn cleanup_idle(slots: &mut [ClientSlot]) {
    for slot in slots.iter_mut() {
        if slot.is_active() && slot.last_activity.elapsed() > CLIENT_TIMEOUT {
            debug!("client {} timed out", slot.remote_ip);
            slot.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_token_basics() {
        assert_eq!(split_token("LIST VAR ups"), ("LIST", "VAR ups"));
        assert_eq!(split_token("HELP"), ("HELP", ""));
        assert_eq!(split_token("GET  VAR  ups"), ("GET", "VAR  ups"));
    }
}
