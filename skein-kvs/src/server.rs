use crate::error::{KvsError, Result};
use crate::protocol::{Reply, Request, decode_request, encode_reply, read_frame, write_frame};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, oneshot};

/// How long a new connection may take to introduce itself.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct BarrierState {
    generation: u64,
    waiters: Vec<oneshot::Sender<u64>>,
}

struct Shared {
    size: usize,
    kvs: Mutex<HashMap<String, Vec<u8>>>,
    committed: Mutex<HashMap<(u32, String), Vec<u8>>>,
    barrier: Mutex<BarrierState>,
}

impl Shared {
    /// Wait until every rank arrives; returns the released generation.
    async fn arrive(&self) -> Result<u64> {
        let rx = {
            let mut b = self.barrier.lock().await;
            let (tx, rx) = oneshot::channel();
            b.waiters.push(tx);
            if b.waiters.len() == self.size {
                let generation = b.generation;
                b.generation += 1;
                for w in b.waiters.drain(..) {
                    let _ = w.send(generation);
                }
                tracing::trace!(generation, "barrier released");
            }
            rx
        };
        rx.await.map_err(|_| KvsError::Closed)
    }

    async fn handle(&self, req: Request) -> Result<Reply> {
        let reply = match req {
            Request::Hello { .. } => {
                return Err(KvsError::Protocol("repeated hello".into()));
            }
            Request::Put { key, value } => {
                self.kvs.lock().await.insert(key, value);
                Reply::Ok
            }
            Request::Get { key } => match self.kvs.lock().await.get(&key) {
                Some(v) => Reply::Value(v.clone()),
                None => Reply::NotFound,
            },
            Request::Commit { rank, entries } => {
                let mut committed = self.committed.lock().await;
                for e in entries {
                    committed.insert((rank, e.key), e.value);
                }
                Reply::Ok
            }
            Request::GetCommitted { rank, key } => {
                match self.committed.lock().await.get(&(rank, key)) {
                    Some(v) => Reply::Value(v.clone()),
                    None => Reply::NotFound,
                }
            }
            Request::Barrier | Request::Fence => Reply::Released(self.arrive().await?),
        };
        Ok(reply)
    }
}

/// Rendezvous server for one job of `size` ranks.
///
/// Serves a flat key-value store, a PMIx-style committed store keyed by
/// rank, and a barrier over all ranks. [`serve`](Self::serve) returns once
/// every rank has connected and disconnected again.
pub struct KvsServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl KvsServer {
    pub async fn bind(addr: SocketAddr, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(KvsError::Rejected("job size must be positive".into()));
        }
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, size, "kvs server listening");
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                size,
                kvs: Mutex::new(HashMap::new()),
                committed: Mutex::new(HashMap::new()),
                barrier: Mutex::new(BarrierState::default()),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection per rank and serve them until they close.
    ///
    /// Connections whose hello is malformed, names a rank outside the job,
    /// or repeats a rank that already joined are turned away without
    /// taking that rank's place.
    pub async fn serve(self) -> Result<()> {
        let size = self.shared.size;
        let mut joined = vec![false; size];
        let mut conns = Vec::with_capacity(size);
        while conns.len() < size {
            let (mut stream, peer) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            let hello = handshake(&mut stream, &mut joined);
            let rank = match tokio::time::timeout(HELLO_TIMEOUT, hello).await {
                Ok(Ok(rank)) => rank,
                Ok(Err(e)) => {
                    tracing::warn!(%peer, "kvs client rejected: {e}");
                    continue;
                }
                Err(_) => {
                    tracing::warn!(%peer, "kvs client sent no hello");
                    continue;
                }
            };
            tracing::debug!(%peer, rank, joined = conns.len() + 1, size, "kvs client joined");
            conns.push(tokio::spawn(serve_conn(stream, rank, Arc::clone(&self.shared))));
        }

        let mut first_err = None;
        for res in futures::future::join_all(conns).await {
            let res = res.map_err(|e| KvsError::Protocol(format!("connection task: {e}")));
            if let Err(e) = res.and_then(|r| r) {
                tracing::warn!("kvs connection failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                tracing::info!(size, "kvs job complete");
                Ok(())
            }
        }
    }

    /// Bind and serve on a dedicated thread with its own runtime.
    pub fn start(addr: SocketAddr, size: usize) -> Result<RunningServer> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let server = rt.block_on(Self::bind(addr, size))?;
        // re-registered with the serving thread's runtime below
        let std_listener = server.listener.into_std()?;
        let shared = server.shared;
        let addr = std_listener.local_addr()?;
        let thread = std::thread::Builder::new()
            .name("skein-kvs".into())
            .spawn(move || -> Result<()> {
                let rt = tokio::runtime::Runtime::new()?;
                rt.block_on(async move {
                    let listener = TcpListener::from_std(std_listener)?;
                    Self { listener, shared }.serve().await
                })
            })?;
        Ok(RunningServer { addr, thread })
    }
}

/// A server running on its own thread.
pub struct RunningServer {
    addr: SocketAddr,
    thread: std::thread::JoinHandle<Result<()>>,
}

impl RunningServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the job to finish.
    pub fn join(self) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| KvsError::Protocol("kvs server thread panicked".into()))?
    }
}

/// Validate a hello against the job; marks the rank as joined on success.
async fn handshake(stream: &mut TcpStream, joined: &mut [bool]) -> Result<u32> {
    let Some(hello) = read_frame(stream).await? else {
        return Err(KvsError::Closed);
    };
    let size = joined.len();
    let (rank, job) = match decode_request(&hello)? {
        Request::Hello { rank, size } => (rank, size as usize),
        other => return Err(KvsError::Protocol(format!("expected hello, got {other:?}"))),
    };
    let refusal = if job != size || rank as usize >= size {
        Some(format!("rank {rank} of {job} does not fit a job of {size}"))
    } else if joined[rank as usize] {
        Some(format!("rank {rank} already joined"))
    } else {
        None
    };
    if let Some(msg) = refusal {
        write_frame(stream, &encode_reply(&Reply::Error(msg.clone()))?).await?;
        return Err(KvsError::Rejected(msg));
    }
    write_frame(stream, &encode_reply(&Reply::Ok)?).await?;
    joined[rank as usize] = true;
    Ok(rank)
}

async fn serve_conn(mut stream: TcpStream, rank: u32, shared: Arc<Shared>) -> Result<()> {
    while let Some(payload) = read_frame(&mut stream).await? {
        let req = decode_request(&payload)?;
        tracing::trace!(rank, ?req, "kvs request");
        let reply = shared.handle(req).await?;
        write_frame(&mut stream, &encode_reply(&reply)?).await?;
    }
    tracing::debug!(rank, "kvs client disconnected");
    Ok(())
}
