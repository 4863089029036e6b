//! In-process ISOBUS line with simulated Oxford instruments.
//!
//! A [`SimHandle`] owns one simulated line. Instruments are attached at
//! ISOBUS addresses; every framed command written to the line is recorded in
//! a journal, routed to the addressed instrument, and answered with the
//! echoed command plus the instrument's data, exactly as real hardware does.
//! Unknown commands are answered with `?<command>`, which fails echo
//! verification. Time-dependent behaviour (magnet ramps, temperature
//! profiles) follows tokio time, so paused-clock tests run instantly.
//!
//! ```rust,ignore
//! let sim = SimHandle::new();
//! sim.attach(1, SimIps120::new());
//! let mut ips = Ips120::with_transport(sim.transport("IPS120 x", 1));
//! ips.set_field(0.1).await?;
//! assert_eq!(sim.commands_for(1), ["J0.1000", "A1"]);
//! ```

use cryo_core::serial::{wrap_shared, InstrumentPort, SharedPort};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

use crate::transport::{DeviceAddress, OxfordTransport, Transport};

/// Resource name used for simulated links.
pub const SIM_RESOURCE: &str = "sim";

// =============================================================================
// Instrument Trait
// =============================================================================

/// A simulated instrument on the line.
pub trait SimInstrument: Send + 'static {
    /// Handles one unframed command. `None` marks the command as unknown.
    fn respond(&mut self, command: &str, now: Instant) -> Option<String>;

    /// Downcast support for [`SimHandle::with_device`].
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// One command seen on the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// ISOBUS address, `None` for unframed commands.
    pub address: Option<u8>,
    /// Command without framing.
    pub command: String,
    /// Command exactly as written, without the terminator.
    pub framed: String,
}

// =============================================================================
// Line
// =============================================================================

#[derive(Default)]
struct LineState {
    devices: BTreeMap<Option<u8>, Box<dyn SimInstrument>>,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
    journal: Vec<JournalEntry>,
    read_waker: Option<Waker>,
    corrupt_next: bool,
}

fn split_frame(framed: &str) -> (Option<u8>, String, bool) {
    let (dollar, rest) = match framed.strip_prefix('$') {
        Some(rest) => (true, rest),
        None => (false, framed),
    };
    let Some(addressed) = rest.strip_prefix('@') else {
        return (None, rest.to_string(), dollar);
    };
    let digits = addressed.chars().take_while(|c| c.is_ascii_digit()).count();
    let address = addressed[..digits].parse::<u8>().ok();
    (address, addressed[digits..].to_string(), dollar)
}

impl LineState {
    fn handle_line(&mut self, framed: String) {
        let (address, command, dollar) = split_frame(&framed);
        self.journal.push(JournalEntry {
            address,
            command: command.clone(),
            framed: framed.clone(),
        });
        let now = Instant::now();
        let Some(device) = self.devices.get_mut(&address) else {
            tracing::trace!(%framed, "No simulated instrument at address");
            return;
        };
        let data = device.respond(&command, now);
        if dollar || framed.starts_with('Q') {
            return;
        }
        let mut reply = match data {
            Some(data) => format!("{}{}\r", framed, data),
            None => format!("?{}\r", framed),
        };
        if std::mem::take(&mut self.corrupt_next) {
            reply.insert(0, '#');
        }
        self.outbound.extend(reply.bytes());
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }
}

/// Port end of a simulated line.
pub struct SimulatedLine {
    state: Arc<Mutex<LineState>>,
}

impl AsyncRead for SimulatedLine {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut state = self.state.lock();
        if state.outbound.is_empty() {
            state.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = buf.remaining().min(state.outbound.len());
        let chunk: Vec<u8> = state.outbound.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for SimulatedLine {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock();
        for &byte in buf {
            if byte == b'\r' {
                let line = String::from_utf8_lossy(&state.inbound).into_owned();
                state.inbound.clear();
                state.handle_line(line);
            } else {
                state.inbound.push(byte);
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl InstrumentPort for SimulatedLine {
    fn bytes_to_read(&self) -> io::Result<u32> {
        Ok(self.state.lock().outbound.len() as u32)
    }

    fn clear_buffers(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.outbound.clear();
        state.inbound.clear();
        Ok(())
    }
}

/// Test-side control of a simulated line.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<LineState>>,
    port: SharedPort,
}

impl Default for SimHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHandle {
    /// Empty line.
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(LineState::default()));
        let port = wrap_shared(Box::new(SimulatedLine { state: state.clone() }));
        Self { state, port }
    }

    /// Attaches an instrument at an ISOBUS address.
    pub fn attach(&self, address: u8, device: impl SimInstrument) {
        self.state.lock().devices.insert(Some(address), Box::new(device));
    }

    /// The shared port every transport on this line uses.
    pub fn port(&self) -> SharedPort {
        self.port.clone()
    }

    /// ISOBUS transport to `address` on this line.
    pub fn transport(&self, name: &str, address: u8) -> Box<dyn Transport> {
        Box::new(OxfordTransport::with_port(
            name,
            DeviceAddress::isobus(SIM_RESOURCE, address),
            self.port(),
        ))
    }

    /// Runs `f` on the instrument at `address` if it has type `T`.
    pub fn with_device<T: SimInstrument, R>(&self, address: u8, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut state = self.state.lock();
        let device = state.devices.get_mut(&Some(address))?;
        device.as_any_mut().downcast_mut::<T>().map(f)
    }

    /// Prefixes the next reply with a junk byte.
    pub fn corrupt_next_reply(&self) {
        self.state.lock().corrupt_next = true;
    }

    /// Queues bytes that nobody asked for.
    pub fn inject_input(&self, bytes: &[u8]) {
        self.state.lock().outbound.extend(bytes.iter().copied());
    }

    /// Every command seen so far.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.clone()
    }

    /// Unframed commands sent to `address`.
    pub fn commands_for(&self, address: u8) -> Vec<String> {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|entry| entry.address == Some(address))
            .map(|entry| entry.command.clone())
            .collect()
    }

    /// Forgets the journal.
    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }
}

// =============================================================================
// Instruments
// =============================================================================

fn parse_arg<T: std::str::FromStr>(command: &str) -> Option<T> {
    command.get(1..)?.trim().parse().ok()
}

/// How a simulated sensor reading evolves.
pub enum TemperatureModel {
    /// Constant reading.
    Fixed(f64),
    /// Reading as a function of seconds since the instrument was created.
    Profile(Box<dyn Fn(f64) -> f64 + Send>),
    /// Relaxes toward the controller setpoint with time constant `tau` (s)
    /// while this sensor drives the heater in auto mode.
    FollowsSetpoint {
        /// Present reading.
        value: f64,
        /// Time constant in seconds.
        tau: f64,
    },
}

/// Simulated ITC503.
pub struct SimItc503 {
    epoch: Instant,
    last: Instant,
    sensors: [TemperatureModel; 3],
    auto: u8,
    control: u8,
    sweep: u8,
    heater_sensor: u8,
    auto_pid: bool,
    /// Last setpoint received.
    pub setpoint: f64,
    /// Last PID received.
    pub pid: (f64, f64, f64),
    /// Last manual heater output received.
    pub heater_output: f64,
    /// Last heater voltage ceiling received (tenths of a volt).
    pub max_voltage_tenths: Option<i64>,
}

impl SimItc503 {
    /// Controller with fixed sensor readings.
    pub fn new(readings: [f64; 3]) -> Self {
        let now = Instant::now();
        Self {
            epoch: now,
            last: now,
            sensors: readings.map(TemperatureModel::Fixed),
            auto: 0,
            control: 0,
            sweep: 0,
            heater_sensor: 1,
            auto_pid: false,
            setpoint: 0.0,
            pid: (0.0, 0.0, 0.0),
            heater_output: 0.0,
            max_voltage_tenths: None,
        }
    }

    /// Replaces one sensor's model.
    pub fn with_sensor(mut self, sensor: u8, model: TemperatureModel) -> Self {
        self.set_sensor(sensor, model);
        self
    }

    /// Replaces one sensor's model in place.
    pub fn set_sensor(&mut self, sensor: u8, model: TemperatureModel) {
        if let Some(slot) = self.sensors.get_mut(usize::from(sensor.saturating_sub(1))) {
            *slot = model;
        }
    }

    /// Starts with auto-PID enabled.
    pub fn with_auto_pid(mut self, enabled: bool) -> Self {
        self.auto_pid = enabled;
        self
    }

    /// Starts with the given heater sensor and auto digit.
    pub fn with_heater(mut self, sensor: u8, auto: u8) -> Self {
        self.heater_sensor = sensor;
        self.auto = auto;
        self
    }

    fn advance(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        let heater_auto = matches!(self.auto, 1 | 3);
        for (index, model) in self.sensors.iter_mut().enumerate() {
            if let TemperatureModel::FollowsSetpoint { value, tau } = model {
                let controlled = heater_auto && usize::from(self.heater_sensor) == index + 1;
                if controlled && dt > 0.0 {
                    let alpha = if *tau > 0.0 { 1.0 - (-dt / *tau).exp() } else { 1.0 };
                    *value += (self.setpoint - *value) * alpha;
                }
            }
        }
    }

    fn reading(&self, sensor: usize, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.epoch).as_secs_f64();
        Some(match self.sensors.get(sensor.checked_sub(1)?)? {
            TemperatureModel::Fixed(value) => *value,
            TemperatureModel::Profile(profile) => profile(elapsed),
            TemperatureModel::FollowsSetpoint { value, .. } => *value,
        })
    }
}

impl SimInstrument for SimItc503 {
    fn respond(&mut self, command: &str, now: Instant) -> Option<String> {
        self.advance(now);
        let verb = command.chars().next()?;
        match verb {
            'X' => Some(format!(
                "0A{}C{}S{:02}H{}L{}",
                self.auto, self.control, self.sweep, self.heater_sensor, u8::from(self.auto_pid)
            )),
            'C' => {
                self.control = parse_arg(command)?;
                Some(String::new())
            }
            'A' => {
                self.auto = parse_arg(command)?;
                Some(String::new())
            }
            'H' => {
                self.heater_sensor = parse_arg(command)?;
                Some(String::new())
            }
            'L' => {
                self.auto_pid = parse_arg::<u8>(command)? == 1;
                Some(String::new())
            }
            'T' => {
                self.setpoint = parse_arg(command)?;
                Some(String::new())
            }
            'P' => {
                self.pid.0 = parse_arg(command)?;
                Some(String::new())
            }
            'I' => {
                self.pid.1 = parse_arg(command)?;
                Some(String::new())
            }
            'D' => {
                self.pid.2 = parse_arg(command)?;
                Some(String::new())
            }
            'M' => {
                self.max_voltage_tenths = Some(parse_arg(command)?);
                Some(String::new())
            }
            'O' => {
                self.heater_output = parse_arg(command)?;
                Some(String::new())
            }
            'R' => match parse_arg::<usize>(command)? {
                0 => Some(format!("{:.4}", self.setpoint)),
                sensor @ 1..=3 => Some(format!("{:.4}", self.reading(sensor, now)?)),
                8 => Some(format!("{:.3}", self.pid.0)),
                9 => Some(format!("{:.1}", self.pid.1)),
                10 => Some(format!("{:.1}", self.pid.2)),
                _ => None,
            },
            _ => None,
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Field ramp shared by both simulated supplies, in tesla.
struct Ramp {
    field: f64,
    target: f64,
    rate_per_min: f64,
    activity: u8,
    last: Instant,
}

impl Ramp {
    fn new() -> Self {
        Self {
            field: 0.0,
            target: 0.0,
            rate_per_min: 0.0,
            activity: 0,
            last: Instant::now(),
        }
    }

    fn advance(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        let goal = match self.activity {
            1 => self.target,
            2 => 0.0,
            _ => return,
        };
        let step = self.rate_per_min / 60.0 * dt;
        let remaining = goal - self.field;
        if remaining.abs() <= step {
            self.field = goal;
        } else {
            self.field += step.copysign(remaining);
        }
    }

    fn sweeping(&self) -> bool {
        let goal = match self.activity {
            1 => self.target,
            2 => 0.0,
            _ => return false,
        };
        self.field != goal
    }
}

/// Simulated IPS120.
pub struct SimIps120 {
    ramp: Ramp,
    control: u8,
    heater: u8,
    mode1: u8,
}

impl Default for SimIps120 {
    fn default() -> Self {
        Self::new()
    }
}

impl SimIps120 {
    /// Supply at zero field, holding.
    pub fn new() -> Self {
        Self {
            ramp: Ramp::new(),
            control: 0,
            heater: 0,
            mode1: 1,
        }
    }

    /// Present output field (T).
    pub fn field(&self) -> f64 {
        self.ramp.field
    }

    /// Forces the output field.
    pub fn set_output(&mut self, field: f64) {
        self.ramp.field = field;
    }

    /// Present activity digit.
    pub fn activity(&self) -> u8 {
        self.ramp.activity
    }
}

impl SimInstrument for SimIps120 {
    fn respond(&mut self, command: &str, now: Instant) -> Option<String> {
        self.ramp.advance(now);
        match command.chars().next()? {
            'X' => Some(format!(
                "00A{}C{}H{}M{}{}P00",
                self.ramp.activity,
                self.control,
                self.heater,
                self.mode1,
                u8::from(self.ramp.sweeping())
            )),
            'J' => {
                self.ramp.target = parse_arg(command)?;
                Some(String::new())
            }
            'T' => {
                self.ramp.rate_per_min = parse_arg(command)?;
                Some(String::new())
            }
            'A' => {
                self.ramp.activity = parse_arg(command)?;
                Some(String::new())
            }
            'C' => {
                self.control = parse_arg(command)?;
                Some(String::new())
            }
            'H' => {
                self.heater = match parse_arg::<u8>(command)? {
                    0 => 0,
                    _ => 1,
                };
                Some(String::new())
            }
            'M' => {
                let mode: u8 = parse_arg(command)?;
                self.mode1 = if mode >= 4 { 5 } else { 1 };
                Some(String::new())
            }
            'P' => {
                parse_arg::<u8>(command)?;
                Some(String::new())
            }
            'R' => match parse_arg::<u8>(command)? {
                7 => Some(format!("{:.4}", self.ramp.field)),
                8 => Some(format!("{:.4}", self.ramp.target)),
                9 => Some(format!("{:.3}", self.ramp.rate_per_min)),
                _ => None,
            },
            _ => None,
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Simulated PS120 (integer millitesla, sign carried by polarity).
pub struct SimPs120 {
    ramp: Ramp,
    magnitude_mt: i64,
    forward: bool,
    control: u8,
    heater: u8,
}

impl Default for SimPs120 {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPs120 {
    /// Supply at zero field, forward, holding.
    pub fn new() -> Self {
        Self {
            ramp: Ramp::new(),
            magnitude_mt: 0,
            forward: true,
            control: 0,
            heater: 0,
        }
    }

    /// Present output field (T).
    pub fn field(&self) -> f64 {
        self.ramp.field
    }

    fn retarget(&mut self) {
        let magnitude = self.magnitude_mt as f64 / 1000.0;
        self.ramp.target = if self.forward { magnitude } else { -magnitude };
    }
}

impl SimInstrument for SimPs120 {
    fn respond(&mut self, command: &str, now: Instant) -> Option<String> {
        self.ramp.advance(now);
        match command.chars().next()? {
            'X' => {
                let polarity1 = if self.ramp.target < 0.0 { 4 } else { 0 };
                let polarity2 = if self.forward { 1 } else { 2 };
                Some(format!(
                    "00A{}C{}H{}M1{}P{}{}",
                    self.ramp.activity,
                    self.control,
                    self.heater,
                    u8::from(self.ramp.sweeping()),
                    polarity1,
                    polarity2
                ))
            }
            'J' => {
                self.magnitude_mt = parse_arg(command)?;
                self.retarget();
                Some(String::new())
            }
            'T' => {
                self.ramp.rate_per_min = parse_arg::<i64>(command)? as f64 / 1000.0;
                Some(String::new())
            }
            'P' => {
                match parse_arg::<u8>(command)? {
                    1 => self.forward = true,
                    2 => self.forward = false,
                    4 => self.forward = !self.forward,
                    _ => {}
                }
                self.retarget();
                Some(String::new())
            }
            'A' => {
                self.ramp.activity = parse_arg(command)?;
                Some(String::new())
            }
            'C' => {
                self.control = parse_arg(command)?;
                Some(String::new())
            }
            'H' => {
                self.heater = match parse_arg::<u8>(command)? {
                    0 => 0,
                    _ => 1,
                };
                Some(String::new())
            }
            'M' => {
                parse_arg::<u8>(command)?;
                Some(String::new())
            }
            'R' => match parse_arg::<u8>(command)? {
                7 => Some(format!("{:.0}", (self.ramp.field * 1000.0).abs())),
                8 => Some(format!("{}", self.magnitude_mt)),
                9 => Some(format!("{:.0}", self.ramp.rate_per_min * 1000.0)),
                _ => None,
            },
            _ => None,
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Simulated valve controller.
#[derive(Default)]
pub struct SimValve {
    bits: [u8; 10],
}

impl SimValve {
    /// All channels at bit 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Present bit of a channel.
    pub fn bit(&self, channel: u8) -> u8 {
        self.bits.get(usize::from(channel)).copied().unwrap_or(0)
    }
}

impl SimInstrument for SimValve {
    fn respond(&mut self, command: &str, _now: Instant) -> Option<String> {
        let mut chars = command.chars();
        match chars.next()? {
            'C' => Some(String::new()),
            'S' => {
                let channel = chars.next()?.to_digit(10)? as usize;
                let bit = chars.next()?.to_digit(10)? as u8;
                *self.bits.get_mut(channel)? = bit;
                Some(String::new())
            }
            'R' => {
                let channel = chars.next()?.to_digit(10)? as usize;
                Some(self.bits.get(channel)?.to_string())
            }
            _ => None,
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{Ips120, MagnetSupply, OxfordValve, Ps120};
    use cryo_core::error::CryoError;
    use std::time::Duration;

    #[test]
    fn test_split_frame() {
        assert_eq!(split_frame("@12R7"), (Some(12), "R7".to_string(), false));
        assert_eq!(split_frame("$@5Q"), (Some(5), "Q".to_string(), true));
        assert_eq!(split_frame("X"), (None, "X".to_string(), false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ips120_ramps_in_tokio_time() {
        let sim = SimHandle::new();
        sim.attach(1, SimIps120::new());
        let mut ips = Ips120::with_transport(sim.transport("IPS120", 1));
        ips.supply_link().open().await.unwrap();

        ips.set_sweep_rate(0.6).await.unwrap();
        ips.set_field(0.1).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let partway = ips.get_field().await.unwrap();
        assert!(partway > 0.0 && partway < 0.1, "field {}", partway);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ips.get_field().await.unwrap(), 0.1);
        assert_eq!(sim.commands_for(1)[..3], ["T0.600", "J0.1000", "A1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ps120_sign_round_trip() {
        let sim = SimHandle::new();
        sim.attach(2, SimPs120::new());
        let mut ps = Ps120::with_transport(sim.transport("PS120", 2));
        ps.supply_link().open().await.unwrap();

        ps.set_sweep_rate(1.2).await.unwrap();
        ps.set_field(-0.05).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ps.get_field().await.unwrap(), -0.05);
        assert_eq!(ps.get_field_setpoint().await.unwrap(), -0.05);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_reply_fails_echo() {
        let sim = SimHandle::new();
        sim.attach(4, SimValve::new());
        let mut valve = OxfordValve::with_transport(sim.transport("Valve", 4), 1, true).unwrap();
        crate::drivers::OxfordInstrument::initialize(&mut valve).await.unwrap();
        sim.corrupt_next_reply();
        assert!(matches!(valve.open_valve().await, Err(CryoError::ProtocolEchoMismatch { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_noise_is_flushed() {
        let sim = SimHandle::new();
        sim.attach(4, SimValve::new());
        let mut valve = OxfordValve::with_transport(sim.transport("Valve", 4), 1, true).unwrap();
        crate::drivers::OxfordInstrument::initialize(&mut valve).await.unwrap();
        sim.inject_input(b"@9R1junk\r");
        valve.open_valve().await.unwrap();
        assert!(valve.is_open().await.unwrap());
        assert_eq!(sim.with_device(4, |v: &mut SimValve| v.bit(1)), Some(1));
    }
}
