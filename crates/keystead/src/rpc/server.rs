//! Line-delimited JSON transports.
//!
//! `serve` speaks over stdio and treats every non-page line as coming from
//! the local operator. The daemon listens on a private socket; its
//! connections only reach the page router until they present the auth
//! token in an `AUTHENTICATE` frame.

use crate::{
    chains::{ChainRpc, LiveChains},
    config::ConfigStore,
    errors::WalletError,
    keystore::crypto::Argon2AesGcm,
    lifecycle::WalletMachine,
    network::{NetworkObserver, NetworkRegistry},
    paths::KeysteadPaths,
    rpc::{
        page::{self, PageEnvelope, PageResponse, PendingIds},
        transport::write_frame,
        ui::{self, UiResponse},
    },
    service::{self, WalletHandle},
    store::{FileKvStore, KvStore, MemoryKvStore},
};
use eyre::Context as _;
use fs2::FileExt as _;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq as _;
use tokio::{
    io::{AsyncBufReadExt as _, AsyncRead, AsyncReadExt as _, AsyncWrite, BufReader},
    sync::mpsc,
    task::{JoinError, JoinSet},
};
use tracing::{info, warn};

pub const MAX_LINE_BYTES: usize = 1_000_000;
/// One frame plus its newline.
const READ_LIMIT: u64 = 1_000_001;
const OUTBOUND_DEPTH: usize = 64;
const AUTHENTICATE: &str = "AUTHENTICATE";

#[cfg(not(unix))]
pub const LOOPBACK_ADDR: &str = "127.0.0.1:41787";

#[cfg(unix)]
use tokio::net::UnixListener;

#[cfg(not(unix))]
use tokio::net::TcpListener;

/// What a connection can reach.
pub struct Router<C> {
    pub wallet: WalletHandle,
    pub chains: Arc<C>,
}

impl<C> Clone for Router<C> {
    fn clone(&self) -> Self {
        Self {
            wallet: self.wallet.clone(),
            chains: Arc::clone(&self.chains),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Trust {
    /// The process owner on stdio.
    Operator,
    /// Socket peers; trusted once they echo this token.
    Token(Arc<str>),
}

struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Load config, state and keys and start the wallet actor.
pub fn open_wallet(paths: &KeysteadPaths, ephemeral: bool) -> eyre::Result<Router<LiveChains>> {
    paths.ensure_private_dirs()?;
    let cfg = ConfigStore::new(paths).load_or_init_default()?;
    let store: Arc<dyn KvStore> = if ephemeral {
        Arc::new(MemoryKvStore::default())
    } else {
        Arc::new(FileKvStore::open(paths.state_dir())?)
    };
    let chains = Arc::new(LiveChains::new(&cfg.retry));
    let observer: Arc<dyn NetworkObserver> = Arc::<LiveChains>::clone(&chains);
    let networks = NetworkRegistry::load(&cfg, Arc::clone(&store))?.with_observer(observer);
    let cipher = Arc::new(Argon2AesGcm::new(&cfg.kdf)?);
    let machine = WalletMachine::load(&cfg, store, cipher, networks)?;
    let wallet = service::spawn(machine)?;
    Ok(Router { wallet, chains })
}

async fn emit<T: Serialize + Sync>(out: &mpsc::Sender<Value>, v: &T) -> eyre::Result<()> {
    out.send(serde_json::to_value(v)?)
        .await
        .map_err(|e| eyre::eyre!("connection writer closed: {e}"))
}

fn reap(done: Result<eyre::Result<()>, JoinError>) {
    match done {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "page request could not be answered"),
        Err(e) => warn!(error = %e, "page request task failed"),
    }
}

fn token_matches(expected: &str, presented: Option<&str>) -> bool {
    presented.is_some_and(|got| bool::from(got.as_bytes().ct_eq(expected.as_bytes())))
}

/// Validate and claim a page request, then answer it on its own task.
async fn start_page_request<C: ChainRpc>(
    v: Value,
    pending: &PendingIds,
    router: &Router<C>,
    out: &mpsc::Sender<Value>,
    tasks: &mut JoinSet<eyre::Result<()>>,
) -> eyre::Result<()> {
    let id = v.get("id").cloned().unwrap_or(Value::Null);
    let envelope: PageEnvelope = match serde_json::from_value(v) {
        Ok(envelope) => envelope,
        Err(e) => {
            let resp = PageResponse::err(id, WalletError::invalid_params(e.to_string()).into());
            return emit(out, &resp).await;
        }
    };
    let Some(claim) = pending.claim(&envelope.id) else {
        warn!(in_flight = pending.in_flight(), "duplicate page request id");
        let dup = WalletError::DuplicateRequest(envelope.id.to_string());
        return emit(out, &PageResponse::err(envelope.id, dup.into())).await;
    };
    let router = router.clone();
    let out = out.clone();
    tasks.spawn(async move {
        let resp = page::route(&router.wallet, router.chains.as_ref(), envelope).await;
        let sent = emit(&out, &resp).await;
        drop(claim);
        sent
    });
    Ok(())
}

/// Serve one connection until the peer hangs up.
///
/// Page requests run concurrently and answer in completion order, each
/// tagged with its own id. Trusted-UI messages are answered in order.
pub async fn serve_lines<R, W, C>(
    reader: R,
    writer: W,
    router: Router<C>,
    trust: Trust,
) -> eyre::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
    C: ChainRpc,
{
    let (out, mut rx) = mpsc::channel::<Value>(OUTBOUND_DEPTH);
    let writer_task = tokio::spawn(async move {
        let mut w = writer;
        while let Some(v) = rx.recv().await {
            write_frame(&mut w, &v).await?;
        }
        Ok::<_, eyre::Report>(())
    });

    let mut reader = BufReader::new(reader);
    let mut frame = Vec::new();
    let pending = PendingIds::default();
    let mut tasks = JoinSet::new();
    let mut trusted = matches!(trust, Trust::Operator);

    loop {
        frame.clear();
        let n = (&mut reader).take(READ_LIMIT).read_until(b'\n', &mut frame).await?;
        if n == 0 {
            break;
        }
        while let Some(done) = tasks.try_join_next() {
            reap(done);
        }
        if n > MAX_LINE_BYTES && frame.last() != Some(&b'\n') {
            warn!(bytes = n, "oversized frame; closing connection");
            break;
        }
        let Ok(line) = std::str::from_utf8(&frame) else {
            warn!("frame is not utf-8");
            continue;
        };
        if line.trim().is_empty() {
            continue;
        }
        let v: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "invalid json from client");
                continue;
            }
        };

        let kind = v.get("type").and_then(Value::as_str).map(str::to_owned);
        match kind.as_deref() {
            Some(page::REQUEST_TYPE) => {
                start_page_request(v, &pending, &router, &out, &mut tasks).await?;
            }
            Some(AUTHENTICATE) => {
                let id = v.get("id").cloned();
                let accepted = match &trust {
                    Trust::Operator => true,
                    Trust::Token(token) => {
                        token_matches(token, v.get("token").and_then(Value::as_str))
                    }
                };
                if !accepted {
                    warn!("connection presented a wrong auth token");
                    emit(&out, &UiResponse::err(id, WalletError::Unauthorized.into())).await?;
                    break;
                }
                trusted = true;
                emit(&out, &UiResponse::ok(id, json!({ "authenticated": true }))).await?;
            }
            Some(_) | None if trusted => {
                let resp = ui::handle(&router.wallet, router.chains.as_ref(), v).await;
                emit(&out, &resp).await?;
            }
            Some(_) | None => {
                let id = v.get("id").cloned();
                emit(&out, &UiResponse::err(id, WalletError::Unauthorized.into())).await?;
            }
        }
    }

    while let Some(done) = tasks.join_next().await {
        reap(done);
    }
    drop(out);
    writer_task.await??;
    Ok(())
}

fn acquire_lock(paths: &KeysteadPaths) -> eyre::Result<std::fs::File> {
    crate::fsutil::ensure_private_dir(&paths.data_dir)?;
    let lock_path = paths.daemon_lock_path();
    let mut opts = std::fs::OpenOptions::new();
    opts.create(true).read(true).write(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        opts.mode(crate::fsutil::MODE_FILE_PRIVATE);
    }
    let lock_file = opts
        .open(&lock_path)
        .with_context(|| format!("open lock file at {}", lock_path.display()))?;
    lock_file
        .try_lock_exclusive()
        .with_context(|| format!("lock already held at {}", lock_path.display()))?;
    Ok(lock_file)
}

/// Serve the local operator over stdin/stdout.
pub async fn run_stdio(paths: &KeysteadPaths, ephemeral: bool) -> eyre::Result<()> {
    // A file-backed wallet has one owner at a time.
    let _lock = (!ephemeral).then(|| acquire_lock(paths)).transpose()?;
    let router = open_wallet(paths, ephemeral)?;
    info!(ephemeral, "serving on stdio");
    serve_lines(tokio::io::stdin(), tokio::io::stdout(), router, Trust::Operator).await
}

#[cfg(unix)]
fn bind_listener(paths: &KeysteadPaths) -> eyre::Result<UnixListener> {
    let p = paths.socket_path();
    if p.exists() {
        let md = std::fs::symlink_metadata(&p).context("stat existing socket path")?;
        if md.file_type().is_symlink() {
            eyre::bail!("refusing to remove symlink at {}", p.display());
        }
        std::fs::remove_file(&p)
            .with_context(|| format!("remove existing socket at {}", p.display()))?;
    }
    if let Some(parent) = p.parent() {
        crate::fsutil::ensure_private_dir(parent)?;
    }
    let l =
        UnixListener::bind(&p).with_context(|| format!("bind unix socket at {}", p.display()))?;

    {
        use std::os::unix::fs::PermissionsExt as _;
        if let Err(e) = std::fs::set_permissions(
            &p,
            std::fs::Permissions::from_mode(crate::fsutil::MODE_FILE_PRIVATE),
        ) {
            warn!(error = %e, "failed to set unix socket permissions");
        }
    }

    Ok(l)
}

#[cfg(not(unix))]
async fn bind_listener(_paths: &KeysteadPaths) -> eyre::Result<TcpListener> {
    TcpListener::bind(LOOPBACK_ADDR)
        .await
        .context("bind tcp listener (loopback)")
}

async fn serve_connection<S>(
    stream: S,
    router: Router<LiveChains>,
    active: Arc<AtomicUsize>,
    token: Arc<str>,
) -> eyre::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    active.fetch_add(1, Ordering::SeqCst);
    let _guard = ActiveGuard {
        active: Arc::clone(&active),
    };
    let (r, w) = tokio::io::split(stream);
    serve_lines(r, w, router, Trust::Token(token)).await
}

pub async fn run_daemon(paths: &KeysteadPaths, idle_exit_seconds: Option<u64>) -> eyre::Result<()> {
    paths.ensure_private_dirs()?;
    let token: Arc<str> = Arc::from(paths.ensure_auth_token()?);
    // Held for the daemon's lifetime.
    let _lock_file = acquire_lock(paths)?;

    let router = open_wallet(paths, false)?;
    let active = Arc::new(AtomicUsize::new(0));

    #[cfg(unix)]
    let listener = bind_listener(paths)?;
    #[cfg(not(unix))]
    let listener = bind_listener(paths).await?;
    info!(idle_exit_seconds, "daemon listening");

    let idle = idle_exit_seconds.map(Duration::from_secs);
    let mut last_empty = Instant::now();

    loop {
        if active.load(Ordering::SeqCst) == 0 {
            if let Some(idle_dur) = idle {
                if last_empty.elapsed() >= idle_dur {
                    info!("idle; exiting");
                    break;
                }
            }
        } else {
            last_empty = Instant::now();
        }

        // Idle checks need a periodic wakeup.
        let tick = idle.map_or(Duration::from_secs(3600), |_| Duration::from_millis(250));
        let accepted = tokio::select! {
            res = tokio::time::timeout(tick, listener.accept()) => res,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; exiting");
                break;
            }
        };
        let stream = match accepted {
            Ok(res) => res.context("accept connection")?.0,
            Err(_) => continue,
        };

        let router2 = router.clone();
        let active2 = Arc::clone(&active);
        let token2 = Arc::clone(&token);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, router2, active2, token2).await {
                warn!(error = %e, "connection handler failed");
            }
        });
    }

    #[cfg(unix)]
    crate::fsutil::remove_if_exists(&paths.socket_path())?;
    Ok(())
}
