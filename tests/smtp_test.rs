//! SMTP integration tests
//!
//! Each test binds a real listener on an ephemeral port and speaks
//! raw RFC 5321 over the socket, then asserts on the files that land
//! in the Maildir.

mod common;

use solomail::smtp::{SmtpOpts, SmtpServer};
use solomail::{Config, Router};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const BODY: &[u8] = b"Subject: integration\r\n\r\nround trip body\r\n";

fn opts_for(mails_path: &Path, config_json: &str) -> Arc<SmtpOpts> {
    let cfg = Config::from_json(config_json).unwrap();
    Arc::new(SmtpOpts {
        mails_path: mails_path.to_path_buf(),
        router: Arc::new(Router::compile(&cfg).unwrap()),
        smtputf8: true,
    })
}

/// Router fixture: `b@mydomain.com` goes to `all`, everything else
/// nowhere.
fn routed_opts(mails_path: &Path) -> Arc<SmtpOpts> {
    opts_for(
        mails_path,
        r#"{"mails_path": "/m",
            "matches": [{"name": "b", "addrs": ["b@mydomain.com"]}],
            "boxes": [{"name": "all", "rules": [{"match_name": "b"}]}]}"#,
    )
}

fn new_files(mails_path: &Path, mbox: &str) -> Vec<PathBuf> {
    let dir = mails_path.join(mbox).join("new");
    if !dir.exists() {
        return Vec::new();
    }
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect()
}

struct SmtpClient<S> {
    io: BufReader<S>,
}

impl SmtpClient<TcpStream> {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            io: BufReader::new(stream),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpClient<S> {
    /// Read one (possibly multiline) reply: `(code, text lines)`.
    async fn read_reply(&mut self) -> (u16, Vec<String>) {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            self.io.read_line(&mut line).await.unwrap();
            assert!(line.len() >= 4, "short SMTP reply {line:?}");
            let code: u16 = line[..3].parse().expect("numeric reply code");
            let last = line.as_bytes()[3] != b'-';
            lines.push(line[4..].trim_end().to_string());
            if last {
                return (code, lines);
            }
        }
    }

    async fn send_line(&mut self, line: &str) {
        self.io
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.io.get_mut().flush().await.unwrap();
    }

    async fn cmd(&mut self, line: &str) -> (u16, Vec<String>) {
        self.send_line(line).await;
        self.read_reply().await
    }

    /// Expect a specific reply code for a command.
    async fn expect(&mut self, line: &str, code: u16) {
        let (got, text) = self.cmd(line).await;
        assert_eq!(got, code, "reply to {line:?} was {got} {text:?}");
    }

    /// Run MAIL/RCPT/DATA for one message body.
    async fn submit(&mut self, from: &str, to: &str, body: &[u8]) {
        self.expect(&format!("MAIL FROM:<{from}>"), 250).await;
        self.expect(&format!("RCPT TO:<{to}>"), 250).await;
        self.expect("DATA", 354).await;
        self.io.get_mut().write_all(body).await.unwrap();
        self.send_line(".").await;
        let (code, text) = self.read_reply().await;
        assert_eq!(code, 250, "end of data rejected: {text:?}");
    }
}

async fn spawn_server(server: SmtpServer) -> SocketAddr {
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    addr
}

// ── Plaintext listener ─────────────────────────────────────────────

#[tokio::test]
async fn plain_delivery_end_to_end() {
    let mails = tempfile::tempdir().unwrap();
    let server = SmtpServer::bind_plain("127.0.0.1:0", routed_opts(mails.path()))
        .await
        .unwrap();
    let addr = spawn_server(server).await;

    let mut client = SmtpClient::connect(addr).await;
    let (code, _) = client.read_reply().await;
    assert_eq!(code, 220);

    client.expect("EHLO tester.example", 250).await;
    // Recipient case must not matter for routing.
    client.submit("a@x.org", "B@MyDomain.com", BODY).await;
    client.expect("QUIT", 221).await;

    let files = new_files(mails.path(), "all");
    assert_eq!(files.len(), 1);
    assert!(files[0].extension().is_some_and(|e| e == "eml"));
    let contents = std::fs::read(&files[0]).unwrap();
    let text = String::from_utf8(contents).unwrap();
    assert!(text.starts_with("X-SSL: Type: plain, STARTTLS: false\r\n"));
    assert!(text.contains("Subject: integration\r\n"));
    assert!(text.ends_with("round trip body\r\n"));
}

#[tokio::test]
async fn plain_listener_does_not_advertise_starttls() {
    let mails = tempfile::tempdir().unwrap();
    let server = SmtpServer::bind_plain("127.0.0.1:0", routed_opts(mails.path()))
        .await
        .unwrap();
    let addr = spawn_server(server).await;

    let mut client = SmtpClient::connect(addr).await;
    client.read_reply().await;
    let (code, lines) = client.cmd("EHLO tester.example").await;
    assert_eq!(code, 250);
    assert!(
        !lines.iter().any(|l| l.to_uppercase().contains("STARTTLS")),
        "plain listener advertised STARTTLS: {lines:?}"
    );
}

#[tokio::test]
async fn unroutable_mail_is_accepted_but_dropped() {
    let mails = tempfile::tempdir().unwrap();
    let server = SmtpServer::bind_plain("127.0.0.1:0", routed_opts(mails.path()))
        .await
        .unwrap();
    let addr = spawn_server(server).await;

    let mut client = SmtpClient::connect(addr).await;
    client.read_reply().await;
    client.expect("EHLO tester.example", 250).await;
    client.submit("a@x.org", "stranger@nowhere.org", BODY).await;

    assert!(new_files(mails.path(), "all").is_empty());
}

#[tokio::test]
async fn two_recipients_fan_out_with_one_filename() {
    let mails = tempfile::tempdir().unwrap();
    let opts = opts_for(
        mails.path(),
        r#"{"mails_path": "/m",
            "matches": [{"name": "vip", "addrs": ["boss@corp.com"]}],
            "boxes": [
                {"name": "important", "rules": [{"match_name": "vip"}]},
                {"name": "all", "rules": [{"match_name": "default_match_all"}]}
            ]}"#,
    );
    let server = SmtpServer::bind_plain("127.0.0.1:0", opts).await.unwrap();
    let addr = spawn_server(server).await;

    let mut client = SmtpClient::connect(addr).await;
    client.read_reply().await;
    client.expect("EHLO tester.example", 250).await;
    client.expect("MAIL FROM:<a@x.org>", 250).await;
    client.expect("RCPT TO:<boss@corp.com>", 250).await;
    client.expect("RCPT TO:<minion@corp.com>", 250).await;
    client.expect("DATA", 354).await;
    client.io.get_mut().write_all(BODY).await.unwrap();
    client.send_line(".").await;
    let (code, _) = client.read_reply().await;
    assert_eq!(code, 250);

    let important = new_files(mails.path(), "important");
    let all = new_files(mails.path(), "all");
    assert_eq!(important.len(), 1);
    assert_eq!(all.len(), 1);
    assert_eq!(important[0].file_name(), all[0].file_name());
}

// ── STARTTLS listener ──────────────────────────────────────────────

#[tokio::test]
async fn starttls_gates_mail_and_stamps_trace_header() {
    let mails = tempfile::tempdir().unwrap();
    let server = SmtpServer::bind_starttls(
        "127.0.0.1:0",
        routed_opts(mails.path()),
        common::self_signed_acceptor(),
        true,
    )
    .await
    .unwrap();
    let addr = spawn_server(server).await;

    let mut client = SmtpClient::connect(addr).await;
    client.read_reply().await;

    let (code, lines) = client.cmd("EHLO tester.example").await;
    assert_eq!(code, 250);
    assert!(
        lines.iter().any(|l| l.to_uppercase().contains("STARTTLS")),
        "STARTTLS not advertised: {lines:?}"
    );

    // Mail transactions are refused until the link is encrypted.
    let (code, _) = client.cmd("MAIL FROM:<a@x.org>").await;
    assert!((500..600).contains(&code), "expected refusal, got {code}");
    assert!(new_files(mails.path(), "all").is_empty());

    let (code, _) = client.cmd("STARTTLS").await;
    assert_eq!(code, 220);

    let tcp = client.io.into_inner();
    let tls_stream = common::trusting_connector()
        .connect("127.0.0.1".try_into().unwrap(), tcp)
        .await
        .unwrap();
    let mut client = SmtpClient {
        io: BufReader::new(tls_stream),
    };

    client.expect("EHLO tester.example", 250).await;
    client.submit("a@x.org", "b@mydomain.com", BODY).await;
    client.expect("QUIT", 221).await;

    let files = new_files(mails.path(), "all");
    assert_eq!(files.len(), 1);
    let text = std::fs::read_to_string(&files[0]).unwrap();
    assert!(text.starts_with("X-SSL: Type: starttls, STARTTLS: true\r\n"));
}

// ── Implicit-TLS listener ──────────────────────────────────────────

#[tokio::test]
async fn implicit_tls_delivery() {
    let mails = tempfile::tempdir().unwrap();
    let server = SmtpServer::bind_implicit_tls(
        "127.0.0.1:0",
        routed_opts(mails.path()),
        common::self_signed_acceptor(),
    )
    .await
    .unwrap();
    let addr = spawn_server(server).await;

    let tcp = TcpStream::connect(addr).await.unwrap();
    let tls_stream = common::trusting_connector()
        .connect("127.0.0.1".try_into().unwrap(), tcp)
        .await
        .unwrap();
    let mut client = SmtpClient {
        io: BufReader::new(tls_stream),
    };

    let (code, _) = client.read_reply().await;
    assert_eq!(code, 220);
    client.expect("EHLO tester.example", 250).await;
    client.submit("a@x.org", "b@mydomain.com", BODY).await;
    client.expect("QUIT", 221).await;

    let files = new_files(mails.path(), "all");
    assert_eq!(files.len(), 1);
    let text = std::fs::read_to_string(&files[0]).unwrap();
    assert!(text.starts_with("X-SSL: Type: plain, STARTTLS: true\r\n"));
}
