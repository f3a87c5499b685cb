use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::client::{ClientDefinition, DefineOutcome};
use crate::constants::HEADER_SIZE;
use crate::request::Request;
use crate::server::{ReplyJob, RequestJob};
use crate::types::{PacketCode, PacketHeader, Value, ValueKind};
use crate::unlang::{Dictionary, ReturnCode, SectionKind, VirtualServer};

/// The leaf codec boundary: attribute decode and reply encode live
/// outside the core.
pub trait PacketCodec: Send + Sync {
    /// Fill the request's pair lists from the packet body.
    fn decode(&self, packet: &[u8], request: &mut Request);

    /// Encode a reply. The response authenticator is the codec's problem;
    /// the core only chooses code and id.
    fn encode(
        &self,
        request: &Request,
        code: PacketCode,
        id: u8,
        request_authenticator: &[u8; 16],
    ) -> Vec<u8>;
}

/// Ships bare headers: no attributes decoded, replies carry the request
/// authenticator verbatim. The default until a real codec is plugged in.
#[derive(Debug, Default)]
pub struct HeaderOnlyCodec;

impl PacketCodec for HeaderOnlyCodec {
    fn decode(&self, _packet: &[u8], _request: &mut Request) {}

    fn encode(
        &self,
        _request: &Request,
        code: PacketCode,
        id: u8,
        request_authenticator: &[u8; 16],
    ) -> Vec<u8> {
        let mut header = PacketHeader::new(code, id);
        header.length = HEADER_SIZE as u16;
        header.authenticator = *request_authenticator;

        let mut buf = Vec::with_capacity(HEADER_SIZE);
        header.write(&mut buf);
        buf
    }
}

/// Everything a worker needs to process requests: the compiled virtual
/// server, the optional dynamic-client definition server, the codec and
/// the processing deadline.
pub struct WorkerContext {
    pub server: Arc<VirtualServer>,
    pub dynamic_server: Option<Arc<VirtualServer>>,
    pub codec: Arc<dyn PacketCodec>,
    pub dict: Arc<Dictionary>,
    pub max_request_time: Duration,
}

impl WorkerContext {
    /// Process one job to completion, bounded by `max_request_time`.
    /// A timeout synthesizes a protocol-error reply that still traverses
    /// the normal reply path so tracking gets cleaned up.
    pub async fn process(&self, job: RequestJob) -> ReplyJob {
        let client = job.client;
        let track = job.track;
        let request_time = job.recv_time;
        let define = job.define;
        let address = job.address;
        let auth = request_authenticator(&job.buffer);

        match timeout(self.max_request_time, self.run(job)).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!("request exceeded max_request_time, synthesizing error reply");
                if define {
                    ReplyJob {
                        client,
                        track,
                        request_time,
                        reply: Vec::new(),
                        define: Some(DefineOutcome::Retry),
                    }
                } else {
                    // Synthesize the protocol-error reject so the reply
                    // still traverses the normal path and the tracking
                    // entry gets cleaned up.
                    let reply = match address.code.nak() {
                        Some(code) => {
                            let request = Request::new();
                            self.codec.encode(&request, code, address.id, &auth)
                        }
                        None => vec![0x00],
                    };
                    ReplyJob {
                        client,
                        track,
                        request_time,
                        reply,
                        define: None,
                    }
                }
            }
        }
    }

    async fn run(&self, job: RequestJob) -> ReplyJob {
        let mut request = Request::with_address(job.address, job.recv_time);
        self.codec.decode(&job.buffer, &mut request);

        if job.define {
            let outcome = self.run_define(&mut request).await;
            return ReplyJob {
                client: job.client,
                track: job.track,
                request_time: job.recv_time,
                reply: Vec::new(),
                define: Some(outcome),
            };
        }

        let reply_code = self.run_sections(&mut request, job.address.code).await;

        let reply = match reply_code {
            Some(code) => {
                let auth = request_authenticator(&job.buffer);
                self.codec.encode(&request, code, job.address.id, &auth)
            }
            None => Vec::new(),
        };

        ReplyJob {
            client: job.client,
            track: job.track,
            request_time: job.recv_time,
            reply,
            define: None,
        }
    }

    /// Run the dynamic-client definition policy and translate its output
    /// into a define outcome.
    async fn run_define(&self, request: &mut Request) -> DefineOutcome {
        let Some(server) = &self.dynamic_server else {
            return DefineOutcome::Nak;
        };

        // Encrypted attributes cannot be decrypted without a shared
        // secret, which does not exist yet. Mash them to harmless values
        // before the policy sees them.
        for pair in request.packet.iter_mut() {
            if self.dict.is_encrypted(&pair.name) {
                pair.value = match pair.value.kind() {
                    ValueKind::Uint32 => Value::Uint32(0),
                    ValueKind::Octets => Value::Octets(vec![0]),
                    _ => Value::String(String::new()),
                };
            }
        }

        let rcode = server
            .run(SectionKind::Authorize, None, request)
            .await;

        match rcode {
            ReturnCode::Ok | ReturnCode::Updated => {}
            ReturnCode::Fail => return DefineOutcome::Retry,
            code => {
                debug!(%code, "dynamic client definition rejected");
                return DefineOutcome::Nak;
            }
        }

        let Some(ipaddr) = self.defined_client_ip(request) else {
            debug!("dynamic client definition did not set a client IP address");
            return DefineOutcome::Nak;
        };

        let secret = request
            .control
            .get("FreeRADIUS-Client-Secret")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        let shortname = request
            .control
            .get("FreeRADIUS-Client-Shortname")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| ipaddr.ip().to_string());

        DefineOutcome::Accept(Box::new(ClientDefinition {
            ipaddr,
            secret,
            shortname,
            require_message_authenticator: false,
            use_connected: false,
        }))
    }

    fn defined_client_ip(&self, request: &Request) -> Option<IpNetwork> {
        let value = request.control.get("FreeRADIUS-Client-IP-Address")?;
        let ip: IpAddr = match value {
            Value::Ipv4Addr(ip) => (*ip).into(),
            Value::Ipv6Addr(ip) => (*ip).into(),
            Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        let prefix = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        IpNetwork::new(ip, prefix).ok()
    }

    /// Walk the processing sections for a packet code and pick the reply
    /// code from the final return code.
    async fn run_sections(
        &self,
        request: &mut Request,
        code: PacketCode,
    ) -> Option<PacketCode> {
        match code {
            PacketCode::AccessRequest => self.run_access(request).await,

            PacketCode::StatusServer => Some(PacketCode::AccessAccept),

            PacketCode::AccountingRequest => {
                let rcode = self
                    .server
                    .run(SectionKind::Preacct, None, request)
                    .await;
                if accepted(rcode) {
                    let rcode = self
                        .server
                        .run(SectionKind::Accounting, None, request)
                        .await;
                    if accepted(rcode) {
                        return Some(PacketCode::AccountingResponse);
                    }
                }
                None
            }

            PacketCode::CoaRequest | PacketCode::DisconnectRequest => {
                let rcode = self.server.run(SectionKind::RecvCoa, None, request).await;
                if accepted(rcode) {
                    code.ack()
                } else {
                    code.nak()
                }
            }

            _ => None,
        }
    }

    async fn run_access(&self, request: &mut Request) -> Option<PacketCode> {
        let rcode = self
            .server
            .run(SectionKind::Authorize, None, request)
            .await;

        let authenticated = match rcode {
            ReturnCode::Handled => {
                return Some(request.reply_code.unwrap_or(PacketCode::AccessAccept))
            }
            ReturnCode::Ok | ReturnCode::Updated | ReturnCode::Noop | ReturnCode::NotFound => {
                let auth_type = request
                    .control
                    .get("Auth-Type")
                    .and_then(|v| v.as_str().map(str::to_string));

                let rcode = self
                    .server
                    .run(SectionKind::Authenticate, auth_type.as_deref(), request)
                    .await;

                matches!(
                    rcode,
                    ReturnCode::Ok | ReturnCode::Updated | ReturnCode::Handled
                )
            }
            _ => false,
        };

        let reply_code = if authenticated {
            PacketCode::AccessAccept
        } else {
            PacketCode::AccessReject
        };

        self.server.run(SectionKind::PostAuth, None, request).await;

        Some(request.reply_code.unwrap_or(reply_code))
    }
}

fn accepted(rcode: ReturnCode) -> bool {
    matches!(
        rcode,
        ReturnCode::Ok | ReturnCode::Updated | ReturnCode::Noop | ReturnCode::Handled
    )
}

fn request_authenticator(packet: &[u8]) -> [u8; 16] {
    let mut auth = [0; 16];
    if packet.len() >= HEADER_SIZE {
        auth.copy_from_slice(&packet[4..HEADER_SIZE]);
    }
    auth
}

/// Spawn the worker pool. Workers share one inbound queue and block
/// freely; the network task never does.
pub fn spawn_workers(
    count: usize,
    ctx: Arc<WorkerContext>,
    rx: mpsc::Receiver<RequestJob>,
    tx: mpsc::Sender<ReplyJob>,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));

    (0..count)
        .map(|index| {
            let ctx = ctx.clone();
            let rx = rx.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                debug!(worker = index, "worker started");
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else {
                        break;
                    };

                    let reply = ctx.process(job).await;
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                }
                debug!(worker = index, "worker stopped");
            })
        })
        .collect()
}
