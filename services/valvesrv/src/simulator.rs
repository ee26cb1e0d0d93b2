//! In-process device simulator
//!
//! Speaks the firmware's line protocol over any byte stream: periodic
//! telemetry, command replies preceded by a `COMMAND_RECEIVED:` echo, and
//! the device's own emergency latch. Tests steer it through
//! [`SimulatorControl`].

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::link::MemoryPeer;
use crate::protocol::codec::TELEMETRY_PREFIX;
use crate::protocol::{CommandVerb, ValvePosition};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    pub telemetry_interval_ms: u64,
    pub base_pressure: f64,
    pub base_concentration: f64,
    /// Random variation around the base readings
    pub noise: bool,
    pub max_pressure: f64,
    pub critical_concentration: f64,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            telemetry_interval_ms: 1_000,
            base_pressure: 2.5,
            base_concentration: 150.0,
            noise: true,
            max_pressure: 6.0,
            critical_concentration: 500.0,
        }
    }
}

/// Sensor values for one telemetry line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub p1: f64,
    pub p2: f64,
    pub c_src: f64,
    pub c_dst: f64,
}

impl Reading {
    pub fn new(p1: f64, p2: f64, c_src: f64, c_dst: f64) -> Self {
        Self { p1, p2, c_src, c_dst }
    }
}

#[derive(Debug)]
enum Script {
    Hold(Option<Reading>),
    Mute(bool),
    Raw(String),
    EmitNow,
}

/// Steering handle for a running simulator
#[derive(Debug, Clone)]
pub struct SimulatorControl {
    tx: mpsc::UnboundedSender<Script>,
}

impl SimulatorControl {
    /// Report exactly these readings until released
    pub fn hold(&self, reading: Reading) {
        let _ = self.tx.send(Script::Hold(Some(reading)));
    }

    pub fn release(&self) {
        let _ = self.tx.send(Script::Hold(None));
    }

    /// Stop answering commands (telemetry continues)
    pub fn mute(&self, muted: bool) {
        let _ = self.tx.send(Script::Mute(muted));
    }

    /// Write an arbitrary line
    pub fn send_raw(&self, line: impl Into<String>) {
        let _ = self.tx.send(Script::Raw(line.into()));
    }

    /// Emit one telemetry line without waiting for the interval
    pub fn emit_now(&self) {
        let _ = self.tx.send(Script::EmitNow);
    }
}

pub struct DeviceSimulator {
    settings: SimulatorSettings,
    valve: ValvePosition,
    emergency: bool,
    muted: bool,
    held: Option<Reading>,
    started: Instant,
    opened_at: Option<Instant>,
    total_runtime: Duration,
    script_rx: mpsc::UnboundedReceiver<Script>,
}

impl DeviceSimulator {
    pub fn new(settings: SimulatorSettings) -> (Self, SimulatorControl) {
        let (tx, script_rx) = mpsc::unbounded_channel();
        let sim = Self {
            settings,
            valve: ValvePosition::Closed,
            emergency: false,
            muted: false,
            held: None,
            started: Instant::now(),
            opened_at: None,
            total_runtime: Duration::ZERO,
            script_rx,
        };
        (sim, SimulatorControl { tx })
    }

    pub fn valve(&self) -> ValvePosition {
        self.valve
    }

    pub fn emergency(&self) -> bool {
        self.emergency
    }

    /// Answer every connection the link opens, one at a time
    pub async fn serve(mut self, mut peer: MemoryPeer, shutdown: CancellationToken) {
        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                s = peer.accept() => match s {
                    Some(stream) => stream,
                    None => break,
                },
            };
            info!("Simulator: link connected");
            if let Err(e) = self.run(stream, shutdown.clone()).await {
                debug!("Simulator connection ended: {}", e);
            }
        }
    }

    /// Drive one connection until the peer closes or shutdown
    pub async fn run<IO>(&mut self, io: IO, shutdown: CancellationToken) -> std::io::Result<()>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(io);
        let mut lines = BufReader::new(reader).lines();
        let period = Duration::from_millis(self.settings.telemetry_interval_ms.max(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            let out: Vec<String> = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                line = lines.next_line() => match line? {
                    Some(command) => self.on_command(&command),
                    None => return Ok(()),
                },
                _ = ticker.tick() => self.tick(),
                Some(script) = self.script_rx.recv() => self.on_script(script),
            };

            for line in out {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
            writer.flush().await?;
        }
    }

    fn on_script(&mut self, script: Script) -> Vec<String> {
        match script {
            Script::Hold(reading) => {
                self.held = reading;
                Vec::new()
            },
            Script::Mute(muted) => {
                self.muted = muted;
                Vec::new()
            },
            Script::Raw(line) => vec![line],
            Script::EmitNow => self.tick(),
        }
    }

    fn on_command(&mut self, command: &str) -> Vec<String> {
        let command = command.trim();
        if command.is_empty() || self.muted {
            return Vec::new();
        }
        let mut out = vec![format!("COMMAND_RECEIVED: {}", command)];
        out.extend(self.respond(command).lines().map(str::to_string));
        out
    }

    /// Firmware reply to one command line
    pub fn respond(&mut self, command: &str) -> String {
        let Ok(verb) = command.parse::<CommandVerb>() else {
            return "ERROR: Unknown command".to_string();
        };

        match verb {
            CommandVerb::Ping => "PONG".to_string(),
            CommandVerb::Info => format!(
                "SYSTEM_INFO: ValveLink simulator; commands: {}",
                CommandVerb::ALL.map(|v| v.as_str()).join(", ")
            ),
            CommandVerb::Status => format!(
                "=== SYSTEM STATUS ===\nValve: {}\nEmergency: {}\nTotal runtime (s): {}\n=====================",
                self.valve,
                if self.emergency { "YES" } else { "NO" },
                self.total_runtime.as_secs()
            ),
            CommandVerb::Open => {
                if self.emergency {
                    return "ERROR: Cannot OPEN - system in EMERGENCY mode.".to_string();
                }
                let r = self.reading();
                if r.p1 > self.settings.max_pressure || r.p2 > self.settings.max_pressure {
                    self.emergency = true;
                    return "ERROR: Overpressure - aborting OPEN.".to_string();
                }
                if r.c_src < 10.0 {
                    return "ERROR: Source concentration too low.".to_string();
                }
                if r.c_dst > 400.0 {
                    return "ERROR: Destination concentration too high.".to_string();
                }
                self.open_valve();
                "VALVE_OPENED".to_string()
            },
            CommandVerb::ForceOpen => {
                self.open_valve();
                "VALVE_OPENED".to_string()
            },
            CommandVerb::Close => {
                if self.valve == ValvePosition::Closed {
                    "VALVE_ALREADY_CLOSED".to_string()
                } else {
                    self.close_valve();
                    "VALVE_CLOSED".to_string()
                }
            },
            CommandVerb::ResetEmergency => {
                self.emergency = false;
                "EVENT: Emergency mode reset successfully.".to_string()
            },
            CommandVerb::TestModeOn => "TEST_MODE: ON".to_string(),
            CommandVerb::TestModeOff => "TEST_MODE: OFF".to_string(),
        }
    }

    /// One telemetry line, plus an event when the device latches emergency
    pub fn tick(&mut self) -> Vec<String> {
        let r = self.reading();
        let line = format!(
            "{}{}",
            TELEMETRY_PREFIX,
            serde_json::json!({
                "t": self.started.elapsed().as_secs(),
                "valve": self.valve.as_str(),
                "p1": r.p1,
                "p2": r.p2,
                "c_src": r.c_src,
                "c_dst": r.c_dst,
                "em": u8::from(self.emergency),
            })
        );
        let mut out = vec![line];

        let cause = if r.p1 > self.settings.max_pressure || r.p2 > self.settings.max_pressure {
            Some("OVER_PRESSURE")
        } else if r.c_src > self.settings.critical_concentration
            || r.c_dst > self.settings.critical_concentration
        {
            Some("CRITICAL_CONCENTRATION")
        } else {
            None
        };
        if let (Some(cause), false) = (cause, self.emergency) {
            self.emergency = true;
            if self.valve == ValvePosition::Open {
                self.close_valve();
            }
            out.push(format!("EVENT: {} - emergency mode triggered.", cause));
        }
        out
    }

    fn reading(&self) -> Reading {
        if let Some(held) = self.held {
            return held;
        }
        let base_p = self.settings.base_pressure;
        let base_c = self.settings.base_concentration;
        if !self.settings.noise {
            return Reading::new(base_p, base_p, base_c, base_c * 0.8);
        }

        let mut rng = rand::thread_rng();
        let surge = if self.valve == ValvePosition::Open {
            rng.gen_range(0.2..0.8)
        } else {
            0.0
        };
        Reading::new(
            round2(base_p + rng.gen_range(-0.5..0.5) + surge),
            round2(base_p + rng.gen_range(-0.5..0.5) + surge),
            round2(base_c + rng.gen_range(-20.0..20.0)),
            round2(base_c * 0.8 + rng.gen_range(-15.0..15.0)),
        )
    }

    fn open_valve(&mut self) {
        if self.valve == ValvePosition::Closed {
            self.opened_at = Some(Instant::now());
        }
        self.valve = ValvePosition::Open;
    }

    fn close_valve(&mut self) {
        if let Some(opened) = self.opened_at.take() {
            self.total_runtime += opened.elapsed();
        }
        self.valve = ValvePosition::Closed;
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
