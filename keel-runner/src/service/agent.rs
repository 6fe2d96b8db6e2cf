//! SSH agent service
//!
//! Each job gets its own `ssh-agent` process. Keys are decrypted in memory and
//! pushed over the agent socket with the `SSH2_AGENTC_ADD_IDENTITY` message,
//! so no private key ever touches the disk.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use openssl::bn::{BigNumContext, BigNumRef};
use openssl::ec::{EcKeyRef, PointConversionForm};
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Private};
use openssl::rsa::RsaRef;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

const SSH_AGENT_FAILURE: u8 = 5;
const SSH_AGENT_SUCCESS: u8 = 6;
const SSH2_AGENTC_ADD_IDENTITY: u8 = 17;

/// Upper bound on an agent reply, replies to ADD_IDENTITY are a single byte
const MAX_REPLY_LEN: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unable to start ssh-agent: {0}")]
    Start(#[source] std::io::Error),

    #[error("ssh-agent exited with {0}")]
    StartFailed(std::process::ExitStatus),

    #[error("unable to parse ssh-agent output: {0}")]
    Output(String),

    #[error("unable to connect to agent socket {path}: {source}")]
    Dial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("agent socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("private key is passphrase protected and no passphrase was given")]
    PassphraseRequired,

    #[error("unable to parse private key: {0}")]
    InvalidKey(String),

    #[error("unsupported key type: {0}")]
    UnsupportedKey(String),

    #[error("agent refused the key")]
    Refused,

    #[error("unexpected agent reply {0}")]
    UnexpectedReply(u8),
}

/// Location of a running agent, exported to the job as
/// `SSH_AUTH_SOCK`/`SSH_AGENT_PID`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub socket: PathBuf,
    pub pid: u32,
}

/// Service trait for starting per-job agents
#[async_trait]
pub trait AgentService: Send + Sync {
    /// Starts a fresh agent and connects to it
    async fn start(&self) -> Result<Box<dyn AgentSession>, AgentError>;
}

/// Handle on one running agent
#[async_trait]
pub trait AgentSession: Send + Sync {
    fn info(&self) -> &AgentInfo;

    /// Loads a PEM private key into the agent
    ///
    /// # Arguments
    /// * `pem` - PKCS#1, PKCS#8 or SEC1 encoded key, possibly encrypted
    /// * `passphrase` - Passphrase of an encrypted key
    async fn add_key(&mut self, pem: &str, passphrase: Option<&str>) -> Result<(), AgentError>;

    /// Stops the agent and removes its socket; safe to call more than once
    fn cleanup(&mut self);
}

/// Agent service backed by the `ssh-agent` binary
pub struct StandardAgentService {
    program: String,
}

impl StandardAgentService {
    pub fn new() -> Self {
        Self::with_program("ssh-agent")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for StandardAgentService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentService for StandardAgentService {
    async fn start(&self) -> Result<Box<dyn AgentSession>, AgentError> {
        let output = Command::new(&self.program)
            .arg("-s")
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(AgentError::Start)?;

        if !output.status.success() {
            return Err(AgentError::StartFailed(output.status));
        }

        let info = parse_agent_output(&String::from_utf8_lossy(&output.stdout))?;
        debug!("Started ssh-agent {} at {}", info.pid, info.socket.display());

        // from here on the agent is ours to stop, even if the dial fails
        let mut session = StandardAgentSession {
            info,
            stream: None,
            cleaned: false,
        };

        let stream = UnixStream::connect(&session.info.socket)
            .await
            .map_err(|source| AgentError::Dial {
                path: session.info.socket.clone(),
                source,
            });
        match stream {
            Ok(stream) => session.stream = Some(stream),
            Err(e) => {
                session.cleanup();
                return Err(e);
            }
        }

        Ok(Box::new(session))
    }
}

struct StandardAgentSession {
    info: AgentInfo,
    stream: Option<UnixStream>,
    cleaned: bool,
}

impl StandardAgentSession {
    async fn request(&mut self, message: Bytes) -> Result<Bytes, AgentError> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            AgentError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "agent session is closed",
            ))
        })?;

        let mut frame = BytesMut::with_capacity(4 + message.len());
        frame.put_u32(message.len() as u32);
        frame.put_slice(&message);
        stream.write_all(&frame).await?;

        let len = stream.read_u32().await? as usize;
        if len == 0 || len > MAX_REPLY_LEN {
            return Err(AgentError::Output(format!("invalid reply length {}", len)));
        }

        let mut reply = vec![0u8; len];
        stream.read_exact(&mut reply).await?;
        Ok(Bytes::from(reply))
    }
}

#[async_trait]
impl AgentSession for StandardAgentSession {
    fn info(&self) -> &AgentInfo {
        &self.info
    }

    async fn add_key(&mut self, pem: &str, passphrase: Option<&str>) -> Result<(), AgentError> {
        let key = parse_private_key(pem, passphrase)?;
        let message = encode_add_identity(&key, "")?;

        let mut reply = self.request(message).await?;
        match reply.get_u8() {
            SSH_AGENT_SUCCESS => Ok(()),
            SSH_AGENT_FAILURE => Err(AgentError::Refused),
            other => Err(AgentError::UnexpectedReply(other)),
        }
    }

    fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        self.stream = None;

        if let Ok(pid) = libc::pid_t::try_from(self.info.pid) {
            // SAFETY: kill(2) has no memory safety requirements
            let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
            if rc != 0 {
                warn!(
                    "Unable to stop ssh-agent {}: {}",
                    pid,
                    std::io::Error::last_os_error()
                );
            }
        }

        remove_socket(&self.info.socket);
        info!("Stopped ssh-agent {}", self.info.pid);
    }
}

impl Drop for StandardAgentSession {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Removes the agent socket and the private directory ssh-agent created for it
fn remove_socket(socket: &Path) {
    let dir = socket
        .parent()
        .filter(|d| {
            d.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("ssh-"))
        });

    let result = match dir {
        Some(dir) => std::fs::remove_dir_all(dir),
        None => std::fs::remove_file(socket),
    };

    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            warn!("Unable to remove agent socket {}: {}", socket.display(), e);
        }
        _ => {}
    }
}

/// Parses the Bourne shell output of `ssh-agent -s`
///
/// ```text
/// SSH_AUTH_SOCK=/tmp/ssh-XXXX/agent.123; export SSH_AUTH_SOCK;
/// SSH_AGENT_PID=124; export SSH_AGENT_PID;
/// echo Agent pid 124;
/// ```
pub fn parse_agent_output(output: &str) -> Result<AgentInfo, AgentError> {
    let mut socket = None;
    let mut pid = None;

    for statement in output.split([';', '\n']) {
        let Some((name, value)) = statement.trim().split_once('=') else {
            continue;
        };
        match name {
            "SSH_AUTH_SOCK" => socket = Some(PathBuf::from(value)),
            "SSH_AGENT_PID" => {
                pid = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| AgentError::Output(format!("invalid pid {:?}", value)))?,
                )
            }
            _ => {}
        }
    }

    match (socket, pid) {
        (Some(socket), Some(pid)) => Ok(AgentInfo { socket, pid }),
        (None, _) => Err(AgentError::Output("SSH_AUTH_SOCK missing".to_string())),
        (_, None) => Err(AgentError::Output("SSH_AGENT_PID missing".to_string())),
    }
}

/// Parses a PEM private key
///
/// OpenSSL reads PKCS#1, PKCS#8 and SEC1 blocks through the same entry point.
/// An empty passphrase is always supplied for unprotected keys so OpenSSL never
/// falls back to prompting on a terminal.
pub fn parse_private_key(pem: &str, passphrase: Option<&str>) -> Result<PKey<Private>, AgentError> {
    let encrypted = pem.contains("ENCRYPTED");
    let passphrase = passphrase.filter(|p| !p.is_empty());

    if encrypted && passphrase.is_none() {
        return Err(AgentError::PassphraseRequired);
    }
    if pem.contains("BEGIN OPENSSH PRIVATE KEY") {
        return Err(AgentError::UnsupportedKey(
            "OpenSSH native format, convert the key to PEM".to_string(),
        ));
    }

    let passphrase = passphrase.unwrap_or_default();
    PKey::private_key_from_pem_passphrase(pem.trim().as_bytes(), passphrase.as_bytes()).map_err(
        |e| {
            if encrypted {
                AgentError::InvalidKey(format!("wrong passphrase or corrupt key ({})", e))
            } else {
                AgentError::InvalidKey(e.to_string())
            }
        },
    )
}

/// Encodes an `SSH2_AGENTC_ADD_IDENTITY` request for `key`
pub fn encode_add_identity(key: &PKey<Private>, comment: &str) -> Result<Bytes, AgentError> {
    let mut buf = BytesMut::new();
    buf.put_u8(SSH2_AGENTC_ADD_IDENTITY);

    match key.id() {
        Id::RSA => {
            let rsa = key.rsa().map_err(invalid)?;
            encode_rsa(&mut buf, &rsa)?
        }
        Id::EC => {
            let ec = key.ec_key().map_err(invalid)?;
            encode_ecdsa(&mut buf, &ec)?
        }
        Id::ED25519 => {
            let private = key.raw_private_key().map_err(invalid)?;
            let public = key.raw_public_key().map_err(invalid)?;

            put_string(&mut buf, b"ssh-ed25519");
            put_string(&mut buf, &public);
            put_string(&mut buf, &[private.as_slice(), public.as_slice()].concat());
        }
        other => return Err(AgentError::UnsupportedKey(format!("{:?}", other))),
    }

    put_string(&mut buf, comment.as_bytes());
    Ok(buf.freeze())
}

fn encode_rsa(buf: &mut BytesMut, rsa: &RsaRef<Private>) -> Result<(), AgentError> {
    let missing = || AgentError::InvalidKey("RSA key lacks CRT parameters".to_string());

    put_string(buf, b"ssh-rsa");
    put_mpint(buf, rsa.n());
    put_mpint(buf, rsa.e());
    put_mpint(buf, rsa.d());
    put_mpint(buf, rsa.iqmp().ok_or_else(missing)?);
    put_mpint(buf, rsa.p().ok_or_else(missing)?);
    put_mpint(buf, rsa.q().ok_or_else(missing)?);
    Ok(())
}

fn encode_ecdsa(buf: &mut BytesMut, ec: &EcKeyRef<Private>) -> Result<(), AgentError> {
    let group = ec.group();
    let curve = match group.curve_name() {
        Some(Nid::X9_62_PRIME256V1) => "nistp256",
        Some(Nid::SECP384R1) => "nistp384",
        Some(Nid::SECP521R1) => "nistp521",
        other => return Err(AgentError::UnsupportedKey(format!("ECDSA curve {:?}", other))),
    };

    let mut ctx = BigNumContext::new().map_err(invalid)?;
    let point = ec
        .public_key()
        .to_bytes(group, PointConversionForm::UNCOMPRESSED, &mut ctx)
        .map_err(invalid)?;

    put_string(buf, format!("ecdsa-sha2-{}", curve).as_bytes());
    put_string(buf, curve.as_bytes());
    put_string(buf, &point);
    put_mpint(buf, ec.private_key());
    Ok(())
}

fn invalid(e: openssl::error::ErrorStack) -> AgentError {
    AgentError::InvalidKey(e.to_string())
}

fn put_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

/// SSH mpint: big endian two's complement, positive values get a leading zero
/// byte when their high bit is set
fn put_mpint(buf: &mut BytesMut, value: &BigNumRef) {
    let bytes = value.to_vec();
    if bytes.first().is_some_and(|b| b & 0x80 != 0) {
        buf.put_u32(bytes.len() as u32 + 1);
        buf.put_u8(0);
        buf.put_slice(&bytes);
    } else {
        put_string(buf, &bytes);
    }
}
