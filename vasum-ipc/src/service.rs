//! Service and Client (§4.6, C6): thin role wrappers over `Processor`
//! that know only "I accept connections" or "I dial one peer", leaving
//! all dispatch to the Processor underneath.
//!
//! Grounded on the teacher's `notify_socket.rs` split between
//! `NotifyListener` (bind + accept) and `NotifySocket` (connect), carried
//! over here at the Processor level instead of the raw socket level.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{self, Visitable};
use crate::error::Result;
use crate::processor::{self, MethodHandler, MethodResult, PeerId, Processor, RawPayload, SignalHandler};

/// Server role (§4.6): owns the listening socket, accepts connections
/// into peers, and dispatches whatever methods/signals the caller
/// registered before `run`.
pub struct Service {
    processor: Arc<Processor>,
}

impl Service {
    /// Binds `path` (the host's `/run/vasum/host.sock` or a zone's
    /// `/run/vasum/<zone>/agent.sock`, §6.1) and starts accepting.
    pub fn bind(path: &Path, backlog: usize) -> Result<Self> {
        Ok(Self { processor: Arc::new(processor::serve(path, backlog)?) })
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    pub fn set_method_handler(&self, id: u32, request_fd_count: u32, handler: MethodHandler) -> Result<()> {
        self.processor.set_method_handler(id, request_fd_count, handler)
    }

    pub fn set_signal_handler(&self, id: u32, fd_count: u32, handler: SignalHandler) {
        self.processor.set_signal_handler(id, fd_count, handler)
    }

    /// Broadcasts a signal, typed at the call site via C4 (§4.4).
    pub fn signal<T: Visitable>(&self, signal_id: u32, value: &T) -> Result<()> {
        let (payload, fds) = codec::encode(value)?;
        self.processor.signal(signal_id, payload, fds);
        Ok(())
    }

    /// Registers the well-known subscribe method (§4.6) and wires it
    /// straight into the Processor's subscriber table, so every `Client`
    /// that calls `set_signal_handler`/`reconnect` against this service
    /// actually gets gated into `signal()`'s broadcast set. A `Service`
    /// that never calls this only ever has `signal()` reach nobody, since
    /// the Processor no longer broadcasts unconditionally.
    pub fn enable_signal_subscriptions(&self) -> Result<()> {
        let processor = self.processor.clone();
        register_subscribe_method(self, move |peer_id, signal_id| {
            processor.subscribe(peer_id, signal_id);
        })
    }

    pub fn stop(&self) {
        self.processor.stop();
    }
}

/// A single subscription a `Client` re-issues on every successful
/// (re)connect, resolving the teacher's dropped-subscription bug (§4.6,
/// §9 Open Question #2): the original silently lost signal delivery
/// across a reconnect because subscription state lived only on the
/// server side, keyed by a connection that no longer existed.
type SharedSignalHandler = Arc<dyn Fn(PeerId, Vec<u8>, Vec<RawFd>) + Send + Sync>;

struct Subscription {
    signal_id: u32,
    fd_count: u32,
    handler: SharedSignalHandler,
}

fn boxed(handler: SharedSignalHandler) -> SignalHandler {
    Box::new(move |peer_id, payload, fds| handler(peer_id, payload, fds))
}

/// Client role (§4.6): dials one peer and exposes typed `call`/`call_async`
/// helpers built on the raw Processor plus C4 encode/decode.
pub struct Client {
    processor: Processor,
    peer_id: PeerId,
    path: PathBuf,
    subscriptions: Vec<Arc<Subscription>>,
}

const SUBSCRIBE_METHOD_ID: u32 = 0xFFFF_FFFE;

impl Client {
    pub fn connect(path: &Path) -> Result<Self> {
        let (processor, peer_id) = processor::dial(path)?;
        Ok(Self { processor, peer_id, path: path.to_path_buf(), subscriptions: Vec::new() })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Typed synchronous call (§4.5/§4.4): encodes `arg`, calls, decodes
    /// the reply as `R`.
    pub fn call<A: Visitable, R: Visitable>(
        &self,
        method_id: u32,
        arg: &A,
        response_fd_count: u32,
        timeout: Duration,
    ) -> Result<R> {
        let (payload, fds) = codec::encode(arg)?;
        let (reply_payload, reply_fds) =
            self.processor.call_sync(method_id, self.peer_id, payload, fds, response_fd_count, timeout)?;
        codec::decode(&reply_payload, reply_fds)
    }

    /// Typed asynchronous call; `cb` receives the decoded reply or error.
    pub fn call_async<A: Visitable, R: Visitable + Send + 'static>(
        &self,
        method_id: u32,
        arg: &A,
        response_fd_count: u32,
        timeout: Duration,
        cb: impl FnOnce(std::result::Result<R, crate::error::Error>) + Send + 'static,
    ) -> Result<()> {
        let (payload, fds) = codec::encode(arg)?;
        self.processor.call_async(
            method_id,
            self.peer_id,
            payload,
            fds,
            response_fd_count,
            timeout,
            Box::new(move |result: std::result::Result<RawPayload, crate::error::Error>| {
                let decoded = result.and_then(|(p, f)| codec::decode(&p, f));
                cb(decoded);
            }),
        )
    }

    /// Subscribes `handler` to `signal_id`, remembering it so a future
    /// `reconnect` can resubscribe without the caller doing anything.
    /// Also sends the well-known subscribe call (§4.6) so a peer that
    /// registered `Service::enable_signal_subscriptions` actually adds us
    /// to its broadcast set. A peer that never registered the subscribe
    /// method (e.g. a bare `Client`-to-`Client` pairing) simply replies
    /// `unknown_method`, which we ignore.
    pub fn set_signal_handler(
        &mut self,
        signal_id: u32,
        fd_count: u32,
        handler: impl Fn(PeerId, Vec<u8>, Vec<RawFd>) + Send + Sync + 'static,
    ) {
        let handler: SharedSignalHandler = Arc::new(handler);
        self.processor.set_signal_handler(signal_id, fd_count, boxed(handler.clone()));
        self.subscriptions.push(Arc::new(Subscription { signal_id, fd_count, handler }));
        self.send_subscribe(signal_id);
    }

    /// Issues the subscribe call for `signal_id` against the peer we're
    /// currently connected to. Best-effort: a peer without the subscribe
    /// method just errors the call, which we swallow.
    fn send_subscribe(&self, signal_id: u32) {
        let (payload, fds) = match codec::encode(&signal_id) {
            Ok(v) => v,
            Err(_) => return,
        };
        let _ = self.processor.call_sync(
            SUBSCRIBE_METHOD_ID,
            self.peer_id,
            payload,
            fds,
            0,
            Duration::from_millis(500),
        );
    }

    /// Drops the old peer and dials again, reapplying every remembered
    /// subscription (§9 Open Question #2's fix) before returning.
    pub fn reconnect(&mut self) -> Result<()> {
        self.processor.stop();
        let (processor, peer_id) = processor::dial(&self.path)?;
        for sub in &self.subscriptions {
            processor.set_signal_handler(sub.signal_id, sub.fd_count, boxed(sub.handler.clone()));
        }
        self.processor = processor;
        self.peer_id = peer_id;
        for sub in &self.subscriptions {
            self.send_subscribe(sub.signal_id);
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.processor.stop();
    }
}

/// Registers the well-known subscribe method a `Service` exposes so a
/// `Client`'s signal subscriptions survive a reconnect (§4.6): a client
/// calls this once per signal id after every successful dial, and the
/// service records the (peer, signal_id) pair so `signal()` broadcasts
/// reach it again. Exercised by hosts that expose signals over a
/// `Service`; a `Client`-to-`Client` pairing has no use for it.
pub fn register_subscribe_method(service: &Service, on_subscribe: impl Fn(PeerId, u32) + Send + Sync + 'static) -> Result<()> {
    service.set_method_handler(
        SUBSCRIBE_METHOD_ID,
        0,
        Box::new(move |peer_id, payload, _fds, result: MethodResult| {
            if let Ok(signal_id) = codec::decode::<u32>(&payload, vec![]) {
                on_subscribe(peer_id, signal_id);
            }
            result.complete(Ok((vec![], vec![])));
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    #[test]
    fn client_calls_a_typed_echo_method_on_a_service() {
        let dir = tempdir().unwrap();
        let sock_path = dir.path().join("svc.sock");

        let service = Service::bind(&sock_path, 4).unwrap();
        service
            .set_method_handler(
                7,
                0,
                Box::new(|_peer, payload, _fds, result| {
                    let value: std::result::Result<u32, _> = codec::decode(&payload, vec![]);
                    match value {
                        Ok(v) => {
                            let (out, _) = codec::encode(&(v * 2)).unwrap();
                            result.complete(Ok((out, vec![])));
                        }
                        Err(_) => result.complete(Err(processor::UserError { code: 1, message: "bad arg".into() })),
                    }
                }),
            )
            .unwrap();

        // Let the listener spin up before dialing.
        std::thread::sleep(Duration::from_millis(20));

        let client = Client::connect(&sock_path).unwrap();
        let doubled: u32 = client.call(7, &21u32, 0, Duration::from_millis(500)).unwrap();
        assert_eq!(doubled, 42);

        client.stop();
        service.stop();
    }

    #[test]
    fn service_signal_reaches_every_connected_client() {
        let dir = tempdir().unwrap();
        let sock_path = dir.path().join("sig.sock");
        let service = Service::bind(&sock_path, 4).unwrap();
        service.enable_signal_subscriptions().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let mut client = Client::connect(&sock_path).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        client.set_signal_handler(9, 0, move |_peer, payload, _fds| {
            let v: u32 = codec::decode(&payload, vec![]).unwrap();
            let _ = tx.send(v);
        });

        service.signal(9, &99u32).unwrap();
        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, 99);

        client.stop();
        service.stop();
    }

    #[test]
    fn service_signal_skips_clients_that_never_subscribed() {
        let dir = tempdir().unwrap();
        let sock_path = dir.path().join("sig2.sock");
        let service = Service::bind(&sock_path, 4).unwrap();
        service.enable_signal_subscriptions().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        // A raw Processor dial that never calls the subscribe method.
        let (raw, _peer_id) = processor::dial(&sock_path).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        raw.set_signal_handler(9, 0, Box::new(move |_peer, payload, _fds| {
            let _ = tx.send(payload);
        }));

        service.signal(9, &99u32).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        raw.stop();
        service.stop();
    }

    #[test]
    fn client_resubscribes_after_reconnect() {
        let dir = tempdir().unwrap();
        let sock_path = dir.path().join("sig3.sock");
        let service = Service::bind(&sock_path, 4).unwrap();
        service.enable_signal_subscriptions().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let mut client = Client::connect(&sock_path).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        client.set_signal_handler(9, 0, move |_peer, payload, _fds| {
            let v: u32 = codec::decode(&payload, vec![]).unwrap();
            let _ = tx.send(v);
        });

        client.reconnect().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        service.signal(9, &7u32).unwrap();
        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, 7);

        client.stop();
        service.stop();
    }

    #[test]
    fn user_error_propagates_to_the_caller() {
        let dir = tempdir().unwrap();
        let sock_path = dir.path().join("err.sock");
        let service = Service::bind(&sock_path, 4).unwrap();
        service
            .set_method_handler(
                11,
                0,
                Box::new(|_peer, _payload, _fds, result| {
                    result.complete(Err(processor::UserError { code: 5, message: "nope".into() }));
                }),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let client = Client::connect(&sock_path).unwrap();
        let result: Result<()> = client.call(11, &(), 0, Duration::from_millis(500));
        match result {
            Err(crate::error::Error::UserError { code, message }) => {
                assert_eq!(code, 5);
                assert_eq!(message, "nope");
            }
            other => panic!("expected a user error, got {:?}", other.is_ok()),
        }

        client.stop();
        service.stop();
    }

    #[test]
    fn call_counter_distinguishes_concurrent_requests() {
        let dir = tempdir().unwrap();
        let sock_path = dir.path().join("ctr.sock");
        let service = Service::bind(&sock_path, 4).unwrap();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_for_handler = counter.clone();
        service
            .set_method_handler(
                12,
                0,
                Box::new(move |_peer, _payload, _fds, result| {
                    let n = counter_for_handler.fetch_add(1, Ordering::SeqCst) + 1;
                    let (out, _) = codec::encode(&n).unwrap();
                    result.complete(Ok((out, vec![])));
                }),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let client = Client::connect(&sock_path).unwrap();
        let first: u32 = client.call(12, &(), 0, Duration::from_millis(500)).unwrap();
        let second: u32 = client.call(12, &(), 0, Duration::from_millis(500)).unwrap();
        assert_eq!((first, second), (1, 2));

        client.stop();
        service.stop();
    }
}
