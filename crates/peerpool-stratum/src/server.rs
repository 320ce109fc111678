//! The Stratum server: session lifecycle, unique extranonce allocation,
//! job broadcast, and submission fan-in to the orchestrator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::mux::{serve_http_once, sniff_first_byte};
use crate::protocol::{parse_request, read_line, write_message, Notification, Request, Response};

/// Submissions buffered toward the orchestrator.
const SUBMISSION_BUFFER: usize = 64;

/// Floor for miner-suggested difficulty.
const MIN_SUGGESTED_DIFFICULTY: f64 = 0.001;

/// Stratum error code for a rejected share.
const ERR_REJECTED: i64 = 23;

#[derive(Debug, Clone)]
pub struct StratumServerConfig {
    /// Difficulty assigned to fresh sessions.
    pub initial_difficulty: f64,
    /// Width of the miner-rolled extranonce2, bytes.
    pub extranonce2_size: usize,
}

impl Default for StratumServerConfig {
    fn default() -> Self {
        Self {
            initial_difficulty: 1.0,
            extranonce2_size: 4,
        }
    }
}

/// A job in Stratum notify form (the standard 9 params).
#[derive(Debug, Clone)]
pub struct JobNotification {
    pub job_id: String,
    pub prev_hash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    pub merkle_branches: Vec<String>,
    pub version: String,
    pub nbits: String,
    pub ntime: String,
    pub clean_jobs: bool,
}

/// A miner share submission, carrying a one-shot responder the orchestrator
/// resolves after validation.
#[derive(Debug)]
pub struct ShareSubmission {
    pub session_id: u64,
    pub worker: String,
    pub job_id: String,
    pub extranonce1: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
    /// Rolled version bits (BIP 310), when the miner sent a 6th param.
    pub version_bits: Option<String>,
    pub difficulty: f64,
    pub respond: oneshot::Sender<Result<(), String>>,
}

struct SessionState {
    subscribed: bool,
    worker: Option<String>,
    difficulty: f64,
}

struct Session {
    id: u64,
    extranonce1: [u8; 4],
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    state: Mutex<SessionState>,
}

impl Session {
    fn extranonce1_hex(&self) -> String {
        hex::encode(self.extranonce1)
    }

    async fn send<T: serde::Serialize>(&self, message: &T) -> bool {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, message).await.is_ok()
    }
}

/// The Stratum v1 server.
pub struct StratumServer {
    config: StratumServerConfig,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    session_counter: AtomicU64,
    extranonce_counter: AtomicU32,
    submit_tx: mpsc::Sender<ShareSubmission>,
}

impl StratumServer {
    /// Returns the server and the submission stream the orchestrator
    /// consumes.
    pub fn new(config: StratumServerConfig) -> (Arc<Self>, mpsc::Receiver<ShareSubmission>) {
        let (submit_tx, submit_rx) = mpsc::channel(SUBMISSION_BUFFER);
        (
            Arc::new(Self {
                config,
                sessions: Mutex::new(HashMap::new()),
                session_counter: AtomicU64::new(0),
                extranonce_counter: AtomicU32::new(1),
                submit_tx,
            }),
            submit_rx,
        )
    }

    /// Accept loop over a bound listener. Connections opening with `{` are
    /// Stratum; everything else gets the HTTP status responder (or is
    /// treated as Stratum when none is set).
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        http_body: Option<Arc<dyn Fn() -> String + Send + Sync>>,
    ) {
        info!(addr = ?listener.local_addr().ok(), "stratum server listening");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            debug!(%peer, "connection accepted");

            let server = Arc::clone(&self);
            let http_body = http_body.clone();
            tokio::spawn(async move {
                let (first, stream) = match sniff_first_byte(stream).await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                match first {
                    None => {}
                    Some(b'{') => server.handle_connection(stream).await,
                    Some(_) => match http_body {
                        Some(body_fn) => {
                            let _ =
                                serve_http_once(stream, 200, "application/json", &body_fn()).await;
                        }
                        // No HTTP handler: let the Stratum path fail to
                        // parse the line and drop the connection.
                        None => server.handle_connection(stream).await,
                    },
                }
            });
        }
    }

    /// Run one Stratum session to completion.
    pub async fn handle_connection<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let id = self.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let en1 = self.extranonce_counter.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session {
            id,
            extranonce1: en1.to_be_bytes(),
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            state: Mutex::new(SessionState {
                subscribed: false,
                worker: None,
                difficulty: self.config.initial_difficulty,
            }),
        });
        self.sessions.lock().unwrap().insert(id, Arc::clone(&session));

        loop {
            let line = match read_line(&mut reader).await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(session = id, error = %e, "read failed, closing session");
                    break;
                }
            };

            let request = match parse_request(&line) {
                Ok(r) => r,
                Err(e) => {
                    debug!(session = id, error = %e, "malformed request");
                    let resp = Response::err(Value::Null, -32700, "parse error");
                    if !session.send(&resp).await {
                        break;
                    }
                    continue;
                }
            };

            if !self.handle_request(&session, request).await {
                break;
            }
        }

        self.sessions.lock().unwrap().remove(&id);
        debug!(session = id, "session closed");
    }

    /// Dispatch one request; false ends the session.
    async fn handle_request(&self, session: &Arc<Session>, request: Request) -> bool {
        match request.method.as_str() {
            "mining.subscribe" => self.on_subscribe(session, request).await,
            "mining.authorize" => self.on_authorize(session, request).await,
            "mining.suggest_difficulty" => self.on_suggest_difficulty(session, request).await,
            "mining.submit" => self.on_submit(session, request).await,
            other => {
                debug!(method = other, "unknown method");
                session
                    .send(&Response::err(request.id, -3, "unknown method"))
                    .await
            }
        }
    }

    async fn on_subscribe(&self, session: &Arc<Session>, request: Request) -> bool {
        let difficulty = {
            let mut state = session.state.lock().unwrap();
            state.subscribed = true;
            state.difficulty
        };

        let sub_id = format!("{:x}", session.id);
        let result = json!([
            [
                ["mining.set_difficulty", sub_id],
                ["mining.notify", sub_id]
            ],
            session.extranonce1_hex(),
            self.config.extranonce2_size,
        ]);
        if !session.send(&Response::ok(request.id, result)).await {
            return false;
        }

        session
            .send(&Notification::new(
                "mining.set_difficulty",
                vec![json!(difficulty)],
            ))
            .await
    }

    async fn on_authorize(&self, session: &Arc<Session>, request: Request) -> bool {
        let worker = request
            .params
            .get(0)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if worker.is_empty() {
            return session
                .send(&Response::err(request.id, -1, "missing worker name"))
                .await;
        }

        session.state.lock().unwrap().worker = Some(worker.clone());
        info!(session = session.id, worker, "miner authorized");
        session
            .send(&Response::ok(request.id, Value::Bool(true)))
            .await
    }

    async fn on_suggest_difficulty(&self, session: &Arc<Session>, request: Request) -> bool {
        let suggested = request
            .params
            .get(0)
            .and_then(Value::as_f64)
            .unwrap_or(self.config.initial_difficulty)
            .max(MIN_SUGGESTED_DIFFICULTY);

        session.state.lock().unwrap().difficulty = suggested;

        if !session
            .send(&Response::ok(request.id, Value::Bool(true)))
            .await
        {
            return false;
        }
        session
            .send(&Notification::new(
                "mining.set_difficulty",
                vec![json!(suggested)],
            ))
            .await
    }

    async fn on_submit(&self, session: &Arc<Session>, request: Request) -> bool {
        let param = |i: usize| {
            request
                .params
                .get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let (worker, job_id, extranonce2, ntime, nonce) = match (
            param(0),
            param(1),
            param(2),
            param(3),
            param(4),
        ) {
            (Some(w), Some(j), Some(e), Some(t), Some(n)) => (w, j, e, t, n),
            _ => {
                return session
                    .send(&Response::err(request.id, -32602, "invalid submit params"))
                    .await
            }
        };

        let difficulty = session.state.lock().unwrap().difficulty;
        let (respond_tx, respond_rx) = oneshot::channel();
        let submission = ShareSubmission {
            session_id: session.id,
            worker,
            job_id,
            extranonce1: session.extranonce1_hex(),
            extranonce2,
            ntime,
            nonce,
            version_bits: param(5),
            difficulty,
            respond: respond_tx,
        };

        if self.submit_tx.try_send(submission).is_err() {
            warn!(session = session.id, "submission queue full");
            return session
                .send(&Response::err(request.id, ERR_REJECTED, "server busy"))
                .await;
        }

        // Answer from a detached task so validation never stalls the read
        // loop.
        let session = Arc::clone(session);
        let id = request.id;
        tokio::spawn(async move {
            let response = match respond_rx.await {
                Ok(Ok(())) => Response::ok(id, Value::Bool(true)),
                Ok(Err(reason)) => Response::err(id, ERR_REJECTED, &reason),
                Err(_) => Response::err(id, ERR_REJECTED, "submission dropped"),
            };
            session.send(&response).await;
        });
        true
    }

    /// Send a job to every subscribed session.
    pub async fn broadcast_job(&self, job: &JobNotification) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.state.lock().unwrap().subscribed)
            .cloned()
            .collect();

        let notification = Notification::new(
            "mining.notify",
            vec![
                json!(job.job_id),
                json!(job.prev_hash),
                json!(job.coinbase1),
                json!(job.coinbase2),
                json!(job.merkle_branches),
                json!(job.version),
                json!(job.nbits),
                json!(job.ntime),
                json!(job.clean_jobs),
            ],
        );

        for session in sessions {
            if !session.send(&notification).await {
                debug!(session = session.id, "notify write failed");
            }
        }
    }

    /// Active session count.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader as TokioBufReader, DuplexStream};

    struct TestMiner {
        stream: TokioBufReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl TestMiner {
        async fn connect(server: &Arc<StratumServer>) -> Self {
            let (client, server_side) = tokio::io::duplex(64 * 1024);
            let srv = Arc::clone(server);
            tokio::spawn(srv.handle_connection(server_side));

            let (read, writer) = tokio::io::split(client);
            Self {
                stream: TokioBufReader::new(read),
                writer,
            }
        }

        async fn send_line(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn read_json(&mut self) -> Value {
            let line = read_line(&mut self.stream).await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn subscribe(&mut self) -> Value {
            self.send_line(r#"{"id":1,"method":"mining.subscribe","params":["test/1.0"]}"#)
                .await;
            let resp = self.read_json().await;
            // Drain the set_difficulty notification.
            let notif = self.read_json().await;
            assert_eq!(notif["method"], "mining.set_difficulty");
            resp
        }

        async fn authorize(&mut self) {
            self.send_line(r#"{"id":2,"method":"mining.authorize","params":["worker1","x"]}"#)
                .await;
            let resp = self.read_json().await;
            assert_eq!(resp["result"], json!(true));
        }
    }

    fn server() -> (Arc<StratumServer>, mpsc::Receiver<ShareSubmission>) {
        StratumServer::new(StratumServerConfig::default())
    }

    #[tokio::test]
    async fn test_subscribe_result_shape() {
        let (server, _submits) = server();
        let mut miner = TestMiner::connect(&server).await;

        let resp = miner.subscribe().await;
        assert_eq!(resp["error"], Value::Null);

        let result = resp["result"].as_array().unwrap();
        assert_eq!(result.len(), 3);
        // extranonce1 is 4 bytes of hex, extranonce2_size matches config.
        assert_eq!(result[1].as_str().unwrap().len(), 8);
        assert_eq!(result[2], json!(4));

        assert_eq!(server.session_count(), 1);
    }

    #[tokio::test]
    async fn test_extranonce_uniqueness() {
        let (server, _submits) = server();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let mut miner = TestMiner::connect(&server).await;
            let resp = miner.subscribe().await;
            let en1 = resp["result"][1].as_str().unwrap().to_string();
            assert!(seen.insert(en1), "duplicate extranonce1");
        }
    }

    #[tokio::test]
    async fn test_authorize() {
        let (server, _submits) = server();
        let mut miner = TestMiner::connect(&server).await;
        miner.subscribe().await;
        miner.authorize().await;
    }

    #[tokio::test]
    async fn test_submit_accept_and_reject() {
        let (server, mut submits) = server();
        let mut miner = TestMiner::connect(&server).await;
        miner.subscribe().await;
        miner.authorize().await;

        // Accepted share.
        miner
            .send_line(
                r#"{"id":4,"method":"mining.submit","params":["worker1","1","0000002a","65432100","deadbeef"]}"#,
            )
            .await;
        let submission = submits.recv().await.unwrap();
        assert_eq!(submission.job_id, "1");
        assert_eq!(submission.nonce, "deadbeef");
        assert_eq!(submission.extranonce1.len(), 8);
        submission.respond.send(Ok(())).unwrap();

        let resp = miner.read_json().await;
        assert_eq!(resp["id"], json!(4));
        assert_eq!(resp["result"], json!(true));

        // Rejected share.
        miner
            .send_line(
                r#"{"id":5,"method":"mining.submit","params":["worker1","1","0000002b","65432100","deadbeef"]}"#,
            )
            .await;
        let submission = submits.recv().await.unwrap();
        submission
            .respond
            .send(Err("share does not meet target".into()))
            .unwrap();

        let resp = miner.read_json().await;
        assert_eq!(resp["id"], json!(5));
        assert_eq!(resp["result"], Value::Null);
        assert_eq!(resp["error"][0], json!(ERR_REJECTED));
    }

    #[tokio::test]
    async fn test_submit_with_version_rolling() {
        let (server, mut submits) = server();
        let mut miner = TestMiner::connect(&server).await;
        miner.subscribe().await;
        miner.authorize().await;

        miner
            .send_line(
                r#"{"id":4,"method":"mining.submit","params":["worker1","1","0000002a","65432100","deadbeef","20000000"]}"#,
            )
            .await;
        let submission = submits.recv().await.unwrap();
        assert_eq!(submission.version_bits.as_deref(), Some("20000000"));
        submission.respond.send(Ok(())).unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_job() {
        let (server, _submits) = server();
        let mut miner = TestMiner::connect(&server).await;
        miner.subscribe().await;
        miner.authorize().await;

        server
            .broadcast_job(&JobNotification {
                job_id: "1".into(),
                prev_hash: "00".repeat(32),
                coinbase1: "01000000".into(),
                coinbase2: "ffffffff".into(),
                merkle_branches: vec![],
                version: "20000000".into(),
                nbits: "1d00ffff".into(),
                ntime: "65432100".into(),
                clean_jobs: true,
            })
            .await;

        let notif = miner.read_json().await;
        assert_eq!(notif["method"], "mining.notify");
        let params = notif["params"].as_array().unwrap();
        assert_eq!(params.len(), 9);
        assert_eq!(params[8], json!(true));
    }

    #[tokio::test]
    async fn test_suggest_difficulty() {
        let (server, _submits) = server();
        let mut miner = TestMiner::connect(&server).await;
        miner.subscribe().await;

        miner
            .send_line(r#"{"id":3,"method":"mining.suggest_difficulty","params":[8.0]}"#)
            .await;
        let resp = miner.read_json().await;
        assert_eq!(resp["result"], json!(true));
        let notif = miner.read_json().await;
        assert_eq!(notif["method"], "mining.set_difficulty");
        assert_eq!(notif["params"][0], json!(8.0));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (server, _submits) = server();
        let mut miner = TestMiner::connect(&server).await;

        miner
            .send_line(r#"{"id":9,"method":"mining.bogus","params":[]}"#)
            .await;
        let resp = miner.read_json().await;
        assert_eq!(resp["error"][0], json!(-3));
    }

    #[tokio::test]
    async fn test_session_count_drops_on_disconnect() {
        let (server, _submits) = server();
        let miner = TestMiner::connect(&server).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(server.session_count(), 1);

        drop(miner);
        // Let the read loop observe EOF.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(server.session_count(), 0);
    }
}
