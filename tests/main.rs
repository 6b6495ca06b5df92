//! End-to-end tests: a real proxy instance between a raw FTP client and
//! scripted mock origins, all over localhost TCP.

use ftpgate::{event_channel, Config, Context, Event, EventReceiver, Middleware, MiddlewareError, MiddlewareFuture, Reply, Server, TlsPair};

use pretty_assertions::assert_eq;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

// Middleware that routes every occurrence of its verb to a fixed origin.
struct Route(String);

#[async_trait::async_trait]
impl Middleware for Route {
    async fn handle(&self, ctx: &mut Context, _arg: &str) -> Result<Option<Reply>, MiddlewareError> {
        ctx.set_next_origin(self.0.clone());
        Ok(None)
    }
}

// Plain-function middleware, like the canonical USER hook when its lookup
// fails: the routing decision is cleared and the default origin stays.
fn keep_default_origin<'a>(ctx: &'a mut Context, _arg: &'a str) -> MiddlewareFuture<'a> {
    Box::pin(async move {
        ctx.clear_next_origin();
        Ok(None)
    })
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        TestClient {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(5), self.reader.read_line(&mut line)).await.unwrap().unwrap();
        line
    }

    // The proxy closes control sockets with linger 0, so the end of the
    // connection may surface as a reset instead of a clean EOF.
    async fn read_closed(&mut self) -> String {
        let mut line = String::new();
        match timeout(Duration::from_secs(5), self.reader.read_line(&mut line)).await.unwrap() {
            Ok(_) => line,
            Err(_) => String::new(),
        }
    }
}

// Boots a scripted origin on the given listener: it greets, then answers
// every command by verb lookup, recording what it received. QUIT closes the
// connection like a real server would.
fn spawn_origin(listener: TcpListener, replies: &'static [(&'static str, &'static str)]) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let seen = log.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"220 origin ready\r\n").await.unwrap();
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            seen.lock().unwrap().push(line.clone());
            let verb = line.split(' ').next().unwrap_or("").to_ascii_uppercase();
            if verb == "QUIT" {
                writer.write_all(b"221 Bye\r\n").await.unwrap();
                break;
            }
            let reply = replies.iter().find(|(v, _)| *v == verb).map(|(_, r)| *r).unwrap_or("200 Ok\r\n");
            writer.write_all(reply.as_bytes()).await.unwrap();
        }
    });
    log
}

async fn start_proxy(server: Server) {
    tokio::spawn(async move {
        server.listen().await.unwrap();
    });
    sleep(Duration::from_millis(150)).await;
}

fn test_config(listen: &str, origin: &str) -> Config {
    Config {
        listen_addr: listen.to_string(),
        remote_addr: origin.to_string(),
        welcome_msg: "test gateway".to_string(),
        ..Config::default()
    }
}

fn drain(event_rx: &mut EventReceiver) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = event_rx.try_recv() {
        events.push(event);
    }
    events
}

// Self-signed keypair for the proxy's client-facing FTPS, written to temp
// files because the server loads its PEMs from disk.
fn write_test_keypair(prefix: &str) -> (PathBuf, PathBuf, rcgen::Certificate) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = std::env::temp_dir();
    let cert_path = dir.join(format!("ftpgate-{}-cert.pem", prefix));
    let key_path = dir.join(format!("ftpgate-{}-key.pem", prefix));
    std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();
    (cert_path, key_path, cert)
}

fn origin_tls_acceptor(cert: &rcgen::Certificate) -> tokio_rustls::TlsAcceptor {
    let certs = vec![rustls::Certificate(cert.serialize_der().unwrap())];
    let key = rustls::PrivateKey(cert.serialize_private_key_der());
    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    tokio_rustls::TlsAcceptor::from(Arc::new(config))
}

fn insecure_tls_client() -> Arc<rustls::ClientConfig> {
    struct AcceptAny;
    impl rustls::client::ServerCertVerifier for AcceptAny {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::Certificate,
            _intermediates: &[rustls::Certificate],
            _server_name: &rustls::ServerName,
            _scts: &mut dyn Iterator<Item = &[u8]>,
            _ocsp_response: &[u8],
            _now: std::time::SystemTime,
        ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::ServerCertVerified::assertion())
        }
    }

    let mut config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    config.dangerous().set_certificate_verifier(Arc::new(AcceptAny));
    Arc::new(config)
}

// One byte at a time so nothing belonging to a following TLS handshake is
// buffered away.
async fn read_raw_line(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// A client that upgrades its control connection with AUTH TLS right after
// the banner, the way FTPS clients do.
struct SecureClient {
    stream: BufReader<tokio_rustls::client::TlsStream<TcpStream>>,
}

impl SecureClient {
    async fn connect(addr: &str) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let banner = timeout(Duration::from_secs(5), read_raw_line(&mut stream)).await.unwrap();
        assert_eq!(banner, "220 test gateway\r\n");
        stream.write_all(b"AUTH TLS\r\n").await.unwrap();
        let ack = timeout(Duration::from_secs(5), read_raw_line(&mut stream)).await.unwrap();
        assert_eq!(ack, "234 AUTH command ok. Expecting TLS Negotiation.\r\n");

        let connector = tokio_rustls::TlsConnector::from(insecure_tls_client());
        let name = rustls::ServerName::try_from("localhost").unwrap();
        let tls = connector.connect(name, stream).await.unwrap();
        SecureClient {
            stream: BufReader::new(tls),
        }
    }

    async fn send(&mut self, line: &str) {
        self.stream.get_mut().write_all(line.as_bytes()).await.unwrap();
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(5), self.stream.read_line(&mut line)).await.unwrap().unwrap();
        line
    }

    async fn read_closed(&mut self) -> String {
        let mut line = String::new();
        match timeout(Duration::from_secs(5), self.stream.read_line(&mut line)).await.unwrap() {
            Ok(_) => line,
            Err(_) => String::new(),
        }
    }
}

#[tokio::test]
async fn pass_through_login_uses_the_default_origin() {
    let origin = TcpListener::bind("127.0.0.1:23112").await.unwrap();
    let origin_log = spawn_origin(
        origin,
        &[
            ("USER", "331 User name okay, need password\r\n"),
            ("PASS", "230 User logged in, proceed\r\n"),
        ],
    );

    let (events, mut event_rx) = event_channel(64);
    let server = Server::new(test_config("127.0.0.1:23111", "127.0.0.1:23112"))
        .event_sink(events)
        .middleware("USER", keep_default_origin);
    start_proxy(server).await;

    let mut client = TestClient::connect("127.0.0.1:23111").await;
    assert_eq!(client.read_line().await, "220 test gateway\r\n");
    client.send("USER alice\r\n").await;
    assert_eq!(client.read_line().await, "331 User name okay, need password\r\n");
    client.send("PASS secret\r\n").await;
    assert_eq!(client.read_line().await, "230 User logged in, proceed\r\n");
    client.send("QUIT\r\n").await;
    assert_eq!(client.read_line().await, "221 Bye\r\n");
    assert_eq!(client.read_closed().await, "");
    drop(client);
    sleep(Duration::from_millis(300)).await;

    let seen = origin_log.lock().unwrap().clone();
    assert_eq!(seen, vec!["USER alice", "PASS secret", "QUIT"]);

    let events = drain(&mut event_rx);
    let connect_at = events.iter().position(|e| matches!(e, Event::ClientConnect { .. }));
    let disconnect_at = events.iter().position(|e| matches!(e, Event::ClientDisconnect { .. }));
    assert!(connect_at.unwrap() < disconnect_at.unwrap());
    let commands: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            Event::ClientCommand { command, .. } => Some(command.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(commands, vec!["USER alice", "PASS ********", "QUIT"]);
}

#[tokio::test]
async fn user_middleware_switches_the_origin_after_login() {
    let first = TcpListener::bind("127.0.0.1:23122").await.unwrap();
    let first_log = spawn_origin(
        first,
        &[
            ("USER", "331 User name okay, need password\r\n"),
            ("PASS", "230 User logged in, proceed\r\n"),
        ],
    );
    let second = TcpListener::bind("127.0.0.1:23123").await.unwrap();
    let second_log = spawn_origin(second, &[("PWD", "257 \"/\" is the current directory\r\n")]);

    let server = Server::new(test_config("127.0.0.1:23121", "127.0.0.1:23122"))
        .middleware("USER", Route("127.0.0.1:23123".to_string()));
    start_proxy(server).await;

    let mut client = TestClient::connect("127.0.0.1:23121").await;
    assert_eq!(client.read_line().await, "220 test gateway\r\n");
    client.send("USER alice\r\n").await;
    assert_eq!(client.read_line().await, "331 User name okay, need password\r\n");
    client.send("PASS secret\r\n").await;
    assert_eq!(client.read_line().await, "230 User logged in, proceed\r\n");

    // give the proxy a beat to finish rebinding
    sleep(Duration::from_millis(300)).await;
    client.send("PWD\r\n").await;
    assert_eq!(client.read_line().await, "257 \"/\" is the current directory\r\n");
    sleep(Duration::from_millis(200)).await;

    assert_eq!(first_log.lock().unwrap().clone(), vec!["USER alice", "PASS secret"]);
    assert_eq!(second_log.lock().unwrap().clone(), vec!["PWD"]);
}

#[tokio::test]
async fn preamble_rejection_by_origin_is_tolerated() {
    let listener = TcpListener::bind("127.0.0.1:23142").await.unwrap();
    let header = Arc::new(Mutex::new(String::new()));
    {
        let header = header.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();

            // the preamble comes before any FTP dialog
            let preamble = lines.next_line().await.unwrap().unwrap();
            *header.lock().unwrap() = preamble;
            writer.write_all(b"500 PROXY not understood\r\n").await.unwrap();
            writer.write_all(b"220 origin ready\r\n").await.unwrap();

            while let Ok(Some(_)) = lines.next_line().await {
                writer.write_all(b"200 Ok\r\n").await.unwrap();
            }
        });
    }

    let mut config = test_config("127.0.0.1:23141", "127.0.0.1:23142");
    config.proxy_protocol = true;
    start_proxy(Server::new(config)).await;

    let mut client = TestClient::connect("127.0.0.1:23141").await;
    // the 500 never surfaces; the next origin line becomes the banner
    assert_eq!(client.read_line().await, "220 test gateway\r\n");
    client.send("NOOP\r\n").await;
    assert_eq!(client.read_line().await, "200 Ok\r\n");

    let preamble = header.lock().unwrap().clone();
    assert!(
        preamble.starts_with("PROXY TCP4 127.0.0.1 127.0.0.1 "),
        "unexpected preamble: {}",
        preamble
    );
}

#[tokio::test]
async fn connection_cap_turns_extra_clients_away() {
    let origin = TcpListener::bind("127.0.0.1:23152").await.unwrap();
    spawn_origin(origin, &[]);

    let mut config = test_config("127.0.0.1:23151", "127.0.0.1:23152");
    config.max_connections = 1;
    start_proxy(Server::new(config)).await;

    let mut first = TestClient::connect("127.0.0.1:23151").await;
    assert_eq!(first.read_line().await, "220 test gateway\r\n");

    let mut second = TestClient::connect("127.0.0.1:23151").await;
    assert_eq!(second.read_line().await, "421 Too many connections, closing control connection.\r\n");
    assert_eq!(second.read_closed().await, "");
}

#[tokio::test]
async fn multi_line_replies_arrive_in_one_piece() {
    let listener = TcpListener::bind("127.0.0.1:23162").await.unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"220 origin ready\r\n").await.unwrap();
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            // dribble the block out to prove the proxy reassembles it
            writer.write_all(b"211-Features:\r\n").await.unwrap();
            sleep(Duration::from_millis(30)).await;
            writer.write_all(b" EPSV\r\n PASV\r\n").await.unwrap();
            sleep(Duration::from_millis(30)).await;
            writer.write_all(b"211 End\r\n").await.unwrap();
        }
    });

    start_proxy(Server::new(test_config("127.0.0.1:23161", "127.0.0.1:23162"))).await;

    let mut client = TestClient::connect("127.0.0.1:23161").await;
    assert_eq!(client.read_line().await, "220 test gateway\r\n");
    client.send("FEAT\r\n").await;
    assert_eq!(client.read_line().await, "211-Features:\r\n");
    assert_eq!(client.read_line().await, " EPSV\r\n");
    assert_eq!(client.read_line().await, " PASV\r\n");
    assert_eq!(client.read_line().await, "211 End\r\n");
}

#[tokio::test]
async fn idle_clients_are_disconnected() {
    let origin = TcpListener::bind("127.0.0.1:23172").await.unwrap();
    spawn_origin(origin, &[]);

    let mut config = test_config("127.0.0.1:23171", "127.0.0.1:23172");
    config.idle_timeout = 1;
    start_proxy(Server::new(config)).await;

    let mut client = TestClient::connect("127.0.0.1:23171").await;
    assert_eq!(client.read_line().await, "220 test gateway\r\n");
    assert_eq!(client.read_line().await, "421 Idle timeout, closing control connection\r\n");
    assert_eq!(client.read_closed().await, "");
}

#[tokio::test]
async fn pasv_is_masqueraded_and_data_is_spliced() {
    let first = TcpListener::bind("127.0.0.1:23132").await.unwrap();
    spawn_origin(
        first,
        &[
            ("USER", "331 User name okay, need password\r\n"),
            ("PASS", "230 User logged in, proceed\r\n"),
        ],
    );

    let payload = vec![0x5au8; 64 * 1024];
    let second = TcpListener::bind("127.0.0.1:23133").await.unwrap();
    {
        let payload = payload.clone();
        tokio::spawn(async move {
            let (stream, _) = second.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            writer.write_all(b"220 origin two\r\n").await.unwrap();
            let mut lines = BufReader::new(reader).lines();
            let mut data_listener: Option<TcpListener> = None;
            while let Ok(Some(line)) = lines.next_line().await {
                let verb = line.split(' ').next().unwrap_or("").to_ascii_uppercase();
                match verb.as_str() {
                    "PASV" => {
                        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                        let port = listener.local_addr().unwrap().port();
                        data_listener = Some(listener);
                        let reply = format!("227 Entering Passive Mode (127,0,0,1,{},{}).\r\n", port / 256, port % 256);
                        writer.write_all(reply.as_bytes()).await.unwrap();
                    }
                    "RETR" => {
                        writer.write_all(b"150 Opening BINARY mode data connection\r\n").await.unwrap();
                        let (mut data, _) = data_listener.take().unwrap().accept().await.unwrap();
                        data.write_all(&payload).await.unwrap();
                        data.shutdown().await.unwrap();
                        drop(data);
                        writer.write_all(b"226 Transfer complete\r\n").await.unwrap();
                    }
                    _ => writer.write_all(b"200 Ok\r\n").await.unwrap(),
                }
            }
        });
    }

    let (events, mut event_rx) = event_channel(64);
    let mut config = test_config("127.0.0.1:23131", "127.0.0.1:23132");
    config.data_chan_proxy = true;
    config.masquerade_ip = Some(Ipv4Addr::new(127, 0, 0, 1));
    let server = Server::new(config)
        .event_sink(events)
        .middleware("USER", Route("127.0.0.1:23133".to_string()));
    start_proxy(server).await;

    let mut client = TestClient::connect("127.0.0.1:23131").await;
    assert_eq!(client.read_line().await, "220 test gateway\r\n");
    client.send("USER alice\r\n").await;
    client.read_line().await;
    client.send("PASS secret\r\n").await;
    assert_eq!(client.read_line().await, "230 User logged in, proceed\r\n");
    sleep(Duration::from_millis(300)).await;

    client.send("PASV\r\n").await;
    let pasv = client.read_line().await;
    assert!(pasv.starts_with("227 Entering Passive Mode (127,0,0,1,"), "unexpected reply: {}", pasv);

    // the advertised port belongs to the proxy, not to origin two
    let inner = &pasv[pasv.find('(').unwrap() + 1..pasv.find(')').unwrap()];
    let fields: Vec<u16> = inner.split(',').map(|f| f.parse().unwrap()).collect();
    let advertised_port = fields[4] * 256 + fields[5];

    let mut data = TcpStream::connect(("127.0.0.1", advertised_port)).await.unwrap();
    client.send("RETR file.bin\r\n").await;
    assert_eq!(client.read_line().await, "150 Opening BINARY mode data connection\r\n");

    let mut received = Vec::new();
    timeout(Duration::from_secs(5), data.read_to_end(&mut received)).await.unwrap().unwrap();
    assert_eq!(received.len(), payload.len());
    assert!(received == payload);
    assert_eq!(client.read_line().await, "226 Transfer complete\r\n");

    sleep(Duration::from_millis(300)).await;
    let events = drain(&mut event_rx);
    let transferred = events.iter().find_map(|e| match e {
        Event::DataTransfer { bytes, .. } => Some(*bytes),
        _ => None,
    });
    assert_eq!(transferred, Some(payload.len() as u64));
}

#[tokio::test]
async fn eprt_is_rewritten_and_the_ack_reflects_the_client_mode() {
    let first = TcpListener::bind("127.0.0.1:23182").await.unwrap();
    spawn_origin(
        first,
        &[
            ("USER", "331 User name okay, need password\r\n"),
            ("PASS", "230 User logged in, proceed\r\n"),
        ],
    );

    let payload = b"stored through the proxy".to_vec();
    let uploaded = Arc::new(Mutex::new(Vec::new()));
    let second = TcpListener::bind("127.0.0.1:23183").await.unwrap();
    {
        let uploaded = uploaded.clone();
        tokio::spawn(async move {
            let (stream, _) = second.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            writer.write_all(b"220 origin two\r\n").await.unwrap();
            let mut lines = BufReader::new(reader).lines();
            let mut data_endpoint: Option<String> = None;
            while let Ok(Some(line)) = lines.next_line().await {
                let verb = line.split(' ').next().unwrap_or("").to_ascii_uppercase();
                match verb.as_str() {
                    "EPRT" => {
                        // |1|ip|port| advertised by the proxy
                        let arg = line.split_once(' ').map(|(_, a)| a).unwrap_or("");
                        let fields: Vec<&str> = arg.split('|').collect();
                        data_endpoint = Some(format!("{}:{}", fields[2], fields[3]));
                        writer.write_all(b"200 Okay then\r\n").await.unwrap();
                    }
                    "STOR" => {
                        writer.write_all(b"150 Ok to send data\r\n").await.unwrap();
                        let mut data = TcpStream::connect(data_endpoint.clone().unwrap()).await.unwrap();
                        let mut body = Vec::new();
                        data.read_to_end(&mut body).await.unwrap();
                        *uploaded.lock().unwrap() = body;
                        writer.write_all(b"226 Transfer complete\r\n").await.unwrap();
                    }
                    _ => writer.write_all(b"200 Ok\r\n").await.unwrap(),
                }
            }
        });
    }

    let mut config = test_config("127.0.0.1:23181", "127.0.0.1:23182");
    config.data_chan_proxy = true;
    let server = Server::new(config).middleware("USER", Route("127.0.0.1:23183".to_string()));
    start_proxy(server).await;

    let mut client = TestClient::connect("127.0.0.1:23181").await;
    assert_eq!(client.read_line().await, "220 test gateway\r\n");
    client.send("USER alice\r\n").await;
    client.read_line().await;
    client.send("PASS secret\r\n").await;
    assert_eq!(client.read_line().await, "230 User logged in, proceed\r\n");
    sleep(Duration::from_millis(300)).await;

    // the client listens for its own data connection, as active mode wants
    let client_data = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_data_port = client_data.local_addr().unwrap().port();
    client.send(&format!("EPRT |1|127.0.0.1|{}|\r\n", client_data_port)).await;
    // whatever the origin said, the ack names the client's own mode
    assert_eq!(client.read_line().await, "200 EPRT command successful.\r\n");

    client.send("STOR up.bin\r\n").await;
    assert_eq!(client.read_line().await, "150 Ok to send data\r\n");

    let (mut data, _) = timeout(Duration::from_secs(5), client_data.accept()).await.unwrap().unwrap();
    data.write_all(&payload).await.unwrap();
    data.shutdown().await.unwrap();
    drop(data);

    assert_eq!(client.read_line().await, "226 Transfer complete\r\n");
    sleep(Duration::from_millis(300)).await;
    assert_eq!(uploaded.lock().unwrap().clone(), payload);
}

#[tokio::test]
async fn auth_tls_is_replayed_against_the_switched_origin() {
    let (cert_path, key_path, cert) = write_test_keypair("replay");

    let first = TcpListener::bind("127.0.0.1:23192").await.unwrap();
    let first_log = spawn_origin(
        first,
        &[
            ("USER", "331 User name okay, need password\r\n"),
            ("PASS", "230 User logged in, proceed\r\n"),
        ],
    );

    // The switched-to origin expects the recorded AUTH TLS first, answers
    // 234 and only then speaks TLS, like a real FTPS server.
    let second = TcpListener::bind("127.0.0.1:23193").await.unwrap();
    let second_log = Arc::new(Mutex::new(Vec::new()));
    {
        let acceptor = origin_tls_acceptor(&cert);
        let seen = second_log.clone();
        tokio::spawn(async move {
            let (mut stream, _) = second.accept().await.unwrap();
            stream.write_all(b"220 origin two\r\n").await.unwrap();

            let auth = read_raw_line(&mut stream).await;
            seen.lock().unwrap().push(auth.trim_end().to_string());
            stream.write_all(b"234 Proceed with negotiation.\r\n").await.unwrap();

            let tls = acceptor.accept(stream).await.unwrap();
            let (reader, mut writer) = tokio::io::split(tls);
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                seen.lock().unwrap().push(line.clone());
                let verb = line.split(' ').next().unwrap_or("").to_ascii_uppercase();
                let reply = if verb == "PWD" {
                    "257 \"/\" is the current directory\r\n"
                } else {
                    "200 Ok\r\n"
                };
                writer.write_all(reply.as_bytes()).await.unwrap();
            }
        });
    }

    let mut config = test_config("127.0.0.1:23191", "127.0.0.1:23192");
    config.tls = Some(TlsPair {
        cert: cert_path,
        key: key_path,
    });
    let server = Server::new(config).middleware("USER", Route("127.0.0.1:23193".to_string()));
    start_proxy(server).await;

    let mut client = SecureClient::connect("127.0.0.1:23191").await;
    client.send("USER alice\r\n").await;
    assert_eq!(client.read_line().await, "331 User name okay, need password\r\n");
    client.send("PASS secret\r\n").await;
    assert_eq!(client.read_line().await, "230 User logged in, proceed\r\n");

    // the switch replays AUTH TLS and handshakes before the pump resumes
    sleep(Duration::from_millis(400)).await;
    client.send("PWD\r\n").await;
    assert_eq!(client.read_line().await, "257 \"/\" is the current directory\r\n");
    sleep(Duration::from_millis(200)).await;

    assert_eq!(first_log.lock().unwrap().clone(), vec!["USER alice", "PASS secret"]);
    assert_eq!(second_log.lock().unwrap().clone(), vec!["AUTH TLS", "PWD"]);
}

#[tokio::test]
async fn origin_refusing_the_tls_replay_closes_with_421() {
    let (cert_path, key_path, _cert) = write_test_keypair("refuse");

    let first = TcpListener::bind("127.0.0.1:23196").await.unwrap();
    spawn_origin(
        first,
        &[
            ("USER", "331 User name okay, need password\r\n"),
            ("PASS", "230 User logged in, proceed\r\n"),
        ],
    );

    // this origin greets fine but rejects the replayed AUTH
    let third = TcpListener::bind("127.0.0.1:23197").await.unwrap();
    let third_log = spawn_origin(third, &[("AUTH", "421 Service not available\r\n")]);

    let mut config = test_config("127.0.0.1:23195", "127.0.0.1:23196");
    config.tls = Some(TlsPair {
        cert: cert_path,
        key: key_path,
    });
    let server = Server::new(config).middleware("USER", Route("127.0.0.1:23197".to_string()));
    start_proxy(server).await;

    let mut client = SecureClient::connect("127.0.0.1:23195").await;
    client.send("USER alice\r\n").await;
    assert_eq!(client.read_line().await, "331 User name okay, need password\r\n");
    client.send("PASS secret\r\n").await;
    assert_eq!(client.read_line().await, "230 User logged in, proceed\r\n");

    // the switch fails on the AUTH replay; the connection dies with 421
    assert_eq!(client.read_line().await, "421 Service not available, closing control connection\r\n");
    assert_eq!(client.read_closed().await, "");

    sleep(Duration::from_millis(200)).await;
    assert_eq!(third_log.lock().unwrap().clone(), vec!["AUTH TLS"]);
}
