//! Test doubles speaking the JSON service protocol on a local socket.

use serde_json::{json, Map, Value};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

pub(crate) const SYS_ID: &str = "123456789";

/// A response as a controller with three active thermostats would send it.
pub(crate) fn sample_state() -> Value {
    json!({
        "SYSID": SYS_ID,
        "DP": {
            "1.1": {
                "ON": 1, "LIVE": 1, "NAME": "Living room", "PL": 1, "TPR": 0,
                "OUT": 1, "CE": 0, "CEF": 1, "HC": 0,
                "TEMP": 20.5, "RH": 45.0, "DEW": 8.2, "DWP": 0, "FROST": 0,
                "XAH": 21.5, "XAC": 25.0, "ECOH": 18.5, "ECOC": 27.0,
                "FHO": 0.0, "FCO": 0.0, "LIM": 3.0
            },
            "1.2": {
                "ON": 1, "LIVE": 1, "NAME": "Bedroom", "OUT": 0, "CE": 1, "HC": 0,
                "TEMP": 19.0, "RH": 50.0,
                "XAH": 20.0, "XAC": 24.0, "ECOH": 18.0, "ECOC": 26.0, "LIM": 2.0
            },
            "1.10": {
                "ON": 1, "LIVE": 0, "NAME": "Garage", "CE": 0, "HC": 0, "TEMP": 12.0,
                "XAH": 10.0, "XAC": 30.0, "ECOH": 8.0, "ECOC": 32.0, "LIM": 0.0
            },
            "1.3": {"ON": 0},
            "1.4": {"ON": 0, "NAME": ""}
        },
        "CE": 0, "HC": 0,
        "MIX": 35.0, "WTEMP": 32.5, "ETEMP": -2.0,
        "XAH": 21.0, "XAC": 25.0, "ECOH": 19.0, "ECOC": 27.0,
        "VER": "1085", "CFGV": 17, "TZ": 1, "UPTIME": 120.5
    })
}

/// Listens on an ephemeral port and answers each connection with `handler`.
///
/// A handler returning `None` keeps the connection open without answering.
pub(crate) struct FakeDevice {
    pub port: u16,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeDevice {
    pub async fn start<H>(handler: H) -> Self
    where
        H: FnMut(&Value) -> Option<Value> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler = Arc::new(Mutex::new(handler));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let handler = handler.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let mut payload = Vec::new();
                    if stream.read_to_end(&mut payload).await.is_err() {
                        return;
                    }
                    let request: Value = serde_json::from_slice(&payload).unwrap_or(Value::Null);
                    recorded.lock().unwrap().push(request.clone());
                    let response = {
                        let mut handler = handler.lock().unwrap();
                        (*handler)(&request)
                    };
                    match response {
                        Some(response) => {
                            let _ = stream.write_all(response.to_string().as_bytes()).await;
                            let _ = stream.shutdown().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                });
            }
        });

        Self { port, requests }
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    /// Waits until at least `count` requests arrived.
    pub async fn wait_for_requests(&self, count: usize) -> Vec<Value> {
        for _ in 0..1000 {
            let requests = self.requests();
            if requests.len() >= count {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {count} requests, got {:?}", self.requests());
    }
}

/// A controller that applies writes only after a number of further reads.
pub(crate) struct Simulator {
    state: Value,
    config: Value,
    delay_reads: u32,
    pending: Vec<(u32, Value)>,
    ignore_writes: bool,
}

impl Simulator {
    pub fn new(state: Value, delay_reads: u32) -> Self {
        Self {
            state,
            config: json!({"NAME": "House", "ICON1": {"HYST": 0.5, "HEAT": 1, "COOL": 1}}),
            delay_reads,
            pending: Vec::new(),
            ignore_writes: false,
        }
    }

    pub fn ignoring_writes(mut self) -> Self {
        self.ignore_writes = true;
        self
    }

    pub fn into_handler(mut self) -> impl FnMut(&Value) -> Option<Value> + Send + 'static {
        move |request| Some(self.handle(request))
    }

    fn handle(&mut self, request: &Value) -> Value {
        if request.get("RELOAD") == Some(&json!(6)) {
            return json!({"SYSID": SYS_ID});
        }
        if request.get("SYSID") != Some(&json!(SYS_ID)) {
            return json!({"ERR": 1});
        }

        let mut write = request.as_object().cloned().unwrap_or_default();
        write.remove("SYSID");
        let reload = write.remove("RELOAD");
        if !write.is_empty() {
            if !self.ignore_writes {
                self.pending.push((self.delay_reads, Value::Object(write)));
            }
            return self.state.clone();
        }

        for (remaining, _) in &mut self.pending {
            *remaining = remaining.saturating_sub(1);
        }
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(remaining, _)| *remaining == 0);
        self.pending = pending;
        for (_, write) in due {
            apply(&mut self.state, &write);
        }

        let mut response = self.state.clone();
        if reload == Some(json!(1)) {
            response["CFG"] = self.config.clone();
        }
        response
    }
}

fn apply(state: &mut Value, write: &Value) {
    let Some(write) = write.as_object() else {
        return;
    };
    for (key, value) in write {
        if key == "DP" {
            let entries = value.as_object().cloned().unwrap_or_default();
            for (id, fields) in entries {
                apply_thermostat(&mut state["DP"][&id], &fields);
            }
        } else {
            state[key] = value.clone();
        }
    }
}

fn apply_thermostat(entry: &mut Value, fields: &Value) {
    let fields: Map<String, Value> = fields.as_object().cloned().unwrap_or_default();
    for (key, value) in fields {
        if key == "REQ" {
            let field = match (entry["CE"] == json!(1), entry["HC"] == json!(1)) {
                (true, true) => "ECOC",
                (true, false) => "ECOH",
                (false, true) => "XAC",
                (false, false) => "XAH",
            };
            entry[field] = value;
        } else {
            entry[key.as_str()] = value;
        }
    }
}

/// A Modbus TCP server over a flat register map.
///
/// Each connection is closed after `requests_per_connection` requests.
#[cfg(feature = "modbus-tcp")]
pub(crate) struct FakeModbus {
    pub port: u16,
    registers: Arc<Mutex<Vec<u16>>>,
    connections: Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(feature = "modbus-tcp")]
impl FakeModbus {
    pub async fn start(registers: Vec<u16>, requests_per_connection: usize) -> Self {
        use std::sync::atomic::Ordering;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let registers = Arc::new(Mutex::new(registers));
        let connections = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let (shared, accepted) = (registers.clone(), connections.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                let registers = shared.clone();
                tokio::spawn(async move {
                    let _ = serve_modbus(stream, registers, requests_per_connection).await;
                });
            }
        });

        Self {
            port,
            registers,
            connections,
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn register(&self, address: u16) -> u16 {
        self.registers.lock().unwrap()[address as usize]
    }
}

#[cfg(feature = "modbus-tcp")]
async fn serve_modbus(
    mut stream: tokio::net::TcpStream,
    registers: Arc<Mutex<Vec<u16>>>,
    requests: usize,
) -> std::io::Result<()> {
    for _ in 0..requests {
        let mut header = [0u8; 7];
        stream.read_exact(&mut header).await?;
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        let mut pdu = vec![0u8; length.saturating_sub(1)];
        stream.read_exact(&mut pdu).await?;

        let address = usize::from(u16::from_be_bytes([pdu[1], pdu[2]]));
        let operand = u16::from_be_bytes([pdu[3], pdu[4]]);
        let body = match pdu[0] {
            0x03 => {
                let registers = registers.lock().unwrap();
                let mut body = vec![0x03, (operand * 2) as u8];
                for register in &registers[address..address + usize::from(operand)] {
                    body.extend(register.to_be_bytes());
                }
                body
            }
            0x06 => {
                registers.lock().unwrap()[address] = operand;
                pdu.clone()
            }
            code => vec![code | 0x80, 0x01],
        };

        let mut frame = header[..4].to_vec();
        frame.extend(((body.len() + 1) as u16).to_be_bytes());
        frame.push(header[6]);
        frame.extend(body);
        stream.write_all(&frame).await?;
    }
    Ok(())
}
