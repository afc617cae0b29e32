//! Modbus TCP register adapter for external EMS/SCADA clients.
//!
//! Exposes the measured telemetry as input registers and accepts P/Q
//! setpoints through holding registers:
//! - input registers 0/2/4/6/8: measured P, Q, V, F, I as f32 word
//!   pairs (little-endian word order)
//! - holding registers 0/2: commanded P (MW) and Q (MVAr)
//!
//! The adapter is an explicit object handed to the driving loop; it
//! holds no process-wide state, so several plants can each run their
//! own server in one process. Setpoint writes are change-detected and
//! forwarded into the command channel stamped with the current
//! simulation time; the registers themselves never touch the core.

use std::future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;

use tokio::net::TcpListener;
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::{Server, accept_tcp_connection};

use crate::command::{CommandSender, SetpointCommand, SharedTime};
use crate::plant::StepOutput;

/// Input-register offsets of the measured f32 word pairs.
pub const REG_MEAS_P: u16 = 0;
pub const REG_MEAS_Q: u16 = 2;
pub const REG_MEAS_V: u16 = 4;
pub const REG_MEAS_F: u16 = 6;
pub const REG_MEAS_I: u16 = 8;

/// Holding-register offsets of the commanded setpoint word pairs.
pub const REG_SET_P: u16 = 0;
pub const REG_SET_Q: u16 = 2;

const REGISTER_COUNT: usize = 16;

/// A setpoint write smaller than this is treated as register noise,
/// not a new command.
const CHANGE_EPS: f32 = 0.001;

/// Register file shared between the server task and the driving loop.
#[derive(Debug)]
struct RegisterBank {
    input: [u16; REGISTER_COUNT],
    holding: [u16; REGISTER_COUNT],
    // Last setpoints forwarded as a command, for change detection.
    cached_p: f32,
    cached_q: f32,
}

impl RegisterBank {
    fn new() -> Self {
        Self {
            input: [0; REGISTER_COUNT],
            holding: [0; REGISTER_COUNT],
            cached_p: 0.0,
            cached_q: 0.0,
        }
    }

    fn write_input_f32(&mut self, addr: u16, value: f32) {
        let words = encode_f32(value);
        self.input[addr as usize] = words[0];
        self.input[addr as usize + 1] = words[1];
    }

    fn holding_f32(&self, addr: u16) -> f32 {
        decode_f32([
            self.holding[addr as usize],
            self.holding[addr as usize + 1],
        ])
    }

    /// Returns the commanded (P, Q) if either moved past the change
    /// threshold since the last forwarded command.
    fn take_setpoint_change(&mut self) -> Option<(f32, f32)> {
        let p = self.holding_f32(REG_SET_P);
        let q = self.holding_f32(REG_SET_Q);
        if (p - self.cached_p).abs() > CHANGE_EPS || (q - self.cached_q).abs() > CHANGE_EPS {
            self.cached_p = p;
            self.cached_q = q;
            Some((p, q))
        } else {
            None
        }
    }
}

/// Handle owned by the driving loop; publishes telemetry into the
/// register bank served to Modbus clients.
#[derive(Debug, Clone)]
pub struct ModbusAdapter {
    bank: Arc<Mutex<RegisterBank>>,
}

impl ModbusAdapter {
    /// Starts a Modbus TCP server on a background thread and returns
    /// the publishing handle.
    ///
    /// Setpoint writes arriving from clients are forwarded through
    /// `commands`, stamped with the time currently published in
    /// `time`. Bind or accept failures are reported to stderr; the
    /// simulation keeps running without the transport, as the original
    /// console simulator did.
    pub fn spawn(addr: SocketAddr, commands: CommandSender, time: SharedTime) -> Self {
        let bank = Arc::new(Mutex::new(RegisterBank::new()));
        let server_bank = Arc::clone(&bank);
        thread::Builder::new()
            .name("modbus-server".into())
            .spawn(move || {
                let rt = match tokio::runtime::Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => {
                        eprintln!("[modbus] cannot start runtime: {e}");
                        return;
                    }
                };
                rt.block_on(serve(addr, server_bank, commands, time));
            })
            .expect("failed to spawn modbus server thread");
        Self { bank }
    }

    /// Publishes the measured sextuple subset of one tick's record to
    /// the input registers. Called by the driving loop once per tick.
    pub fn publish(&self, out: &StepOutput) {
        let mut bank = self.bank.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        bank.write_input_f32(REG_MEAS_P, out.meas_p_mw as f32);
        bank.write_input_f32(REG_MEAS_Q, out.meas_q_mvar as f32);
        bank.write_input_f32(REG_MEAS_V, out.meas_v_pu as f32);
        bank.write_input_f32(REG_MEAS_F, out.meas_f_hz as f32);
        bank.write_input_f32(REG_MEAS_I, out.meas_i_ka as f32);
    }
}

async fn serve(
    addr: SocketAddr,
    bank: Arc<Mutex<RegisterBank>>,
    commands: CommandSender,
    time: SharedTime,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("[modbus] cannot bind {addr}: {e}");
            return;
        }
    };
    eprintln!("[modbus] server active on {addr}");

    let server = Server::new(listener);
    let new_service = move |_socket_addr| {
        Ok(Some(PlantService {
            bank: Arc::clone(&bank),
            commands: commands.clone(),
            time: time.clone(),
        }))
    };
    let on_connected = move |stream, socket_addr| {
        let new_service = new_service.clone();
        async move { accept_tcp_connection(stream, socket_addr, new_service) }
    };
    let on_process_error = |err| {
        eprintln!("[modbus] {err}");
    };
    if let Err(e) = server.serve(&on_connected, on_process_error).await {
        eprintln!("[modbus] server error: {e}");
    }
}

/// Per-connection Modbus service over the shared register bank.
struct PlantService {
    bank: Arc<Mutex<RegisterBank>>,
    commands: CommandSender,
    time: SharedTime,
}

impl PlantService {
    fn read_registers(file: &[u16; REGISTER_COUNT], addr: u16, cnt: u16) -> Result<Vec<u16>, ExceptionCode> {
        let start = addr as usize;
        let end = start + cnt as usize;
        if end > REGISTER_COUNT {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(file[start..end].to_vec())
    }

    fn write_holding(&self, addr: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        let start = addr as usize;
        let end = start + values.len();
        if end > REGISTER_COUNT {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let mut bank = self.bank.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        bank.holding[start..end].copy_from_slice(values);

        if let Some((p, q)) = bank.take_setpoint_change() {
            let cmd = SetpointCommand {
                p_mw: f64::from(p),
                q_mvar: f64::from(q),
                time_s: self.time.now_s(),
            };
            if let Err(e) = self.commands.send(cmd) {
                // The adapter filters, it never feeds errors to the
                // core; an operator can resend the setpoint.
                eprintln!("[modbus] command dropped: {e}");
            }
        }
        Ok(())
    }
}

impl tokio_modbus::server::Service for PlantService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadInputRegisters(addr, cnt) => {
                let bank = self.bank.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                Self::read_registers(&bank.input, addr, cnt).map(Response::ReadInputRegisters)
            }
            Request::ReadHoldingRegisters(addr, cnt) => {
                let bank = self.bank.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                Self::read_registers(&bank.holding, addr, cnt).map(Response::ReadHoldingRegisters)
            }
            Request::WriteMultipleRegisters(addr, values) => self
                .write_holding(addr, &values)
                .map(|_| Response::WriteMultipleRegisters(addr, values.len() as u16)),
            Request::WriteSingleRegister(addr, value) => self
                .write_holding(addr, std::slice::from_ref(&value))
                .map(|_| Response::WriteSingleRegister(addr, value)),
            _ => Err(ExceptionCode::IllegalFunction),
        };
        future::ready(res)
    }
}

/// Splits an f32 into two registers, low word first, each word in
/// little-endian byte order. Matches the original BitConverter layout
/// that existing EMS clients decode.
fn encode_f32(value: f32) -> [u16; 2] {
    let b = value.to_le_bytes();
    [
        u16::from_le_bytes([b[0], b[1]]),
        u16::from_le_bytes([b[2], b[3]]),
    ]
}

fn decode_f32(words: [u16; 2]) -> f32 {
    let lo = words[0].to_le_bytes();
    let hi = words[1].to_le_bytes();
    f32::from_le_bytes([lo[0], lo[1], hi[0], hi[1]])
}
