//! Statement dispatcher: tokenizes a line, resolves its leading keyword
//! to a [`QueryKind`] the way the grammar's `TokenKind` resolves to a
//! reserved word, then issues the matching HTTP (or WebSocket, for
//! `WATCH`) call against `kv-server` and prints the result.
//!
//! This replaces what used to be a direct call into an in-process
//! storage engine: every branch below is a thin `reqwest` call against
//! the routes `kv-server` exposes, not a local computation.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use colored::Colorize;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};

use crate::ast::token_kind::TokenKind;
use crate::ast::tokenizer::Tokenizer;
use crate::config::ClientConfig;
use crate::show::Show;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryKind {
    Create,
    Show,
    Get,
    Set,
    Del,
    Purge,
    Keys,
    History,
    Watch,
    Upload,
    Download,
    Verify,
    Info,
    Exit,
}

impl TryFrom<TokenKind> for QueryKind {
    type Error = anyhow::Error;

    fn try_from(kind: TokenKind) -> Result<Self> {
        Ok(match kind {
            TokenKind::CREATE => QueryKind::Create,
            TokenKind::SHOW | TokenKind::DESCRIBE => QueryKind::Show,
            TokenKind::GET | TokenKind::SELECT => QueryKind::Get,
            TokenKind::SET | TokenKind::PUT | TokenKind::SETEX => QueryKind::Set,
            TokenKind::DEL | TokenKind::DELETE | TokenKind::UNSET => QueryKind::Del,
            TokenKind::PURGE => QueryKind::Purge,
            TokenKind::KEYS | TokenKind::LIST => QueryKind::Keys,
            TokenKind::HISTORY => QueryKind::History,
            TokenKind::WATCH => QueryKind::Watch,
            TokenKind::UPLOAD => QueryKind::Upload,
            TokenKind::DOWNLOAD => QueryKind::Download,
            TokenKind::VERIFY => QueryKind::Verify,
            TokenKind::INFO | TokenKind::STATUS => QueryKind::Info,
            TokenKind::EXIT => QueryKind::Exit,
            other => bail!("'{other:?}' is not a statement this client understands"),
        })
    }
}

/// One whitespace/operator-delimited word from a statement, quotes
/// already stripped by [`crate::ast::tokenizer::Token::get_slice`].
struct Word {
    kind: TokenKind,
    text: String,
}

fn words(line: &str) -> Result<Vec<Word>> {
    let mut out = Vec::new();
    for token in Tokenizer::new(line) {
        let token = token.map_err(|e| anyhow!(e))?;
        match token.kind {
            TokenKind::EOI | TokenKind::Newline | TokenKind::Comment => {}
            TokenKind::SemiColon => {}
            _ => out.push(Word { kind: token.kind, text: token.get_slice().to_string() }),
        }
    }
    Ok(out)
}

/// Outcome of a single dispatched statement, so the REPL loop and the
/// non-interactive runner can both decide what to do next.
pub enum Outcome {
    Continue,
    Exit,
}

pub struct Session {
    http: reqwest::Client,
    pub config: ClientConfig,
}

impl Session {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Session { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.server_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, self.url(path));
        if let Some(tenant) = &self.config.tenant {
            req = req.header("x-tenant-id", tenant);
        }
        req
    }

    async fn send_json(&self, req: reqwest::RequestBuilder) -> Result<Value> {
        let resp = req.send().await.context("sending request")?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            bail!("{} ({})", message, status);
        }
        Ok(body)
    }

    fn print_json(&self, value: &Value) {
        let raw = serde_json::to_string_pretty(value).unwrap_or_default();
        match jsonxf::pretty_print(&raw) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{raw}"),
        }
    }

    /// Tokenizes and executes one statement, returning whether the
    /// caller's loop should keep going.
    pub async fn dispatch(&mut self, line: &str) -> Result<Outcome> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Outcome::Continue);
        }

        let words = words(line)?;
        let Some(first) = words.first() else {
            return Ok(Outcome::Continue);
        };
        let kind = QueryKind::try_from(first.kind)?;
        let show = Show::new(self.config.show_stats, true);
        let rest = &words[1..];

        let affected = match kind {
            QueryKind::Exit => return Ok(Outcome::Exit),
            QueryKind::Info => self.do_info().await?,
            QueryKind::Create => self.do_create(rest).await?,
            QueryKind::Show => self.do_show(rest).await?,
            QueryKind::Keys => self.do_keys(rest).await?,
            QueryKind::Set => self.do_set(rest).await?,
            QueryKind::Get => self.do_get(rest).await?,
            QueryKind::Del => self.do_del(rest).await?,
            QueryKind::Purge => self.do_purge(rest).await?,
            QueryKind::History => self.do_history(rest).await?,
            QueryKind::Upload => self.do_upload(rest).await?,
            QueryKind::Download => self.do_download(rest).await?,
            QueryKind::Verify => self.do_verify(rest).await?,
            QueryKind::Watch => self.do_watch(rest).await?,
        };

        show.output(affected);
        Ok(Outcome::Continue)
    }

    async fn do_info(&self) -> Result<i64> {
        let body = self.send_json(self.request(reqwest::Method::GET, "/healthz")).await?;
        self.print_json(&body);
        Ok(0)
    }

    fn is_object(words: &[Word]) -> bool {
        matches!(words.first(), Some(w) if w.kind == TokenKind::OBJECT || w.kind == TokenKind::OBJECTS)
    }

    fn word_at<'a>(words: &'a [Word], idx: usize, what: &str) -> Result<&'a str> {
        words
            .get(idx)
            .map(|w| w.text.as_str())
            .ok_or_else(|| anyhow!("missing {what}"))
    }

    async fn do_create(&self, words: &[Word]) -> Result<i64> {
        if Self::is_object(words) {
            let name = Self::word_at(words, 2, "bucket name")?;
            let req = self.request(reqwest::Method::POST, "/api/v1/objects/buckets").json(&json!({ "name": name }));
            let body = self.send_json(req).await?;
            self.print_json(&body);
            return Ok(1);
        }
        let name = Self::word_at(words, 1, "bucket name")?;
        let req = self.request(reqwest::Method::POST, "/api/v1/kv/buckets").json(&json!({ "name": name }));
        let body = self.send_json(req).await?;
        self.print_json(&body);
        Ok(1)
    }

    /// `SHOW BUCKETS` / `SHOW BUCKET <name>` list or describe KV buckets;
    /// `SHOW OBJECT BUCKETS` / `SHOW OBJECT BUCKET <name>` do the same for
    /// object buckets; `SHOW OBJECTS <bucket>` lists the objects in one,
    /// and `SHOW OBJECT <bucket> <name>` describes a single object.
    async fn do_show(&self, words: &[Word]) -> Result<i64> {
        match words.first().map(|w| w.kind) {
            Some(TokenKind::BUCKETS) => {
                let body = self.send_json(self.request(reqwest::Method::GET, "/api/v1/kv/buckets")).await?;
                let count = body.as_array().map(Vec::len).unwrap_or(0) as i64;
                self.print_json(&body);
                Ok(count)
            }
            Some(TokenKind::BUCKET) => {
                let name = Self::word_at(words, 1, "bucket name")?;
                let body = self.send_json(self.request(reqwest::Method::GET, &format!("/api/v1/kv/buckets/{name}"))).await?;
                self.print_json(&body);
                Ok(1)
            }
            Some(TokenKind::OBJECTS) => {
                let bucket = Self::word_at(words, 1, "bucket name")?;
                let mut path = format!("/api/v1/objects/buckets/{bucket}/objects");
                if let Some(idx) = words.iter().position(|w| w.kind == TokenKind::PATTERN) {
                    let prefix = Self::word_at(words, idx + 1, "pattern")?;
                    path = format!("{path}?prefix={}", urlencode(prefix));
                }
                let body = self.send_json(self.request(reqwest::Method::GET, &path)).await?;
                let count = body.as_array().map(Vec::len).unwrap_or(0) as i64;
                self.print_json(&body);
                Ok(count)
            }
            Some(TokenKind::OBJECT) => match words.get(1).map(|w| w.kind) {
                Some(TokenKind::BUCKETS) => {
                    let body = self.send_json(self.request(reqwest::Method::GET, "/api/v1/objects/buckets")).await?;
                    let count = body.as_array().map(Vec::len).unwrap_or(0) as i64;
                    self.print_json(&body);
                    Ok(count)
                }
                Some(TokenKind::BUCKET) => {
                    let name = Self::word_at(words, 2, "bucket name")?;
                    let body = self
                        .send_json(self.request(reqwest::Method::GET, &format!("/api/v1/objects/buckets/{name}")))
                        .await?;
                    self.print_json(&body);
                    Ok(1)
                }
                _ => {
                    let bucket = Self::word_at(words, 1, "bucket name")?;
                    let name = Self::word_at(words, 2, "object name")?;
                    let path = format!("/api/v1/objects/buckets/{bucket}/objects/{name}/metadata");
                    let body = self.send_json(self.request(reqwest::Method::GET, &path)).await?;
                    self.print_json(&body);
                    Ok(1)
                }
            },
            _ => bail!("expected BUCKET, BUCKETS, OBJECT or OBJECTS after SHOW"),
        }
    }

    async fn do_keys(&self, words: &[Word]) -> Result<i64> {
        let bucket = Self::word_at(words, 0, "bucket name")?;
        let mut path = format!("/api/v1/kv/buckets/{bucket}/keys");
        if let Some(idx) = words.iter().position(|w| w.kind == TokenKind::PATTERN) {
            let prefix = Self::word_at(words, idx + 1, "pattern")?;
            path = format!("{path}?prefix={}", urlencode(prefix));
        }
        let body = self.send_json(self.request(reqwest::Method::GET, &path)).await?;
        let count = body.as_array().map(Vec::len).unwrap_or(0) as i64;
        self.print_json(&body);
        Ok(count)
    }

    async fn do_set(&self, words: &[Word]) -> Result<i64> {
        let bucket = Self::word_at(words, 0, "bucket name")?;
        let key = Self::word_at(words, 1, "key")?;
        let value = Self::word_at(words, 2, "value")?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(value.as_bytes());

        let mut path = format!("/api/v1/kv/buckets/{bucket}/keys/{key}");
        if let Some(idx) = words.iter().position(|w| w.kind == TokenKind::CAS) {
            let expected = Self::word_at(words, idx + 1, "expected revision")?;
            path = format!("{path}?expectedRevision={expected}");
        }

        let mut payload = json!({ "value": encoded });
        if let Some(idx) = words.iter().position(|w| w.kind == TokenKind::EXPIRE) {
            let secs: i64 = Self::word_at(words, idx + 1, "ttl seconds")?.parse()?;
            payload["ttlSeconds"] = json!(secs);
        }

        let req = self.request(reqwest::Method::PUT, &path).json(&payload);
        let body = self.send_json(req).await?;
        self.print_json(&body);
        Ok(1)
    }

    async fn do_get(&self, words: &[Word]) -> Result<i64> {
        let bucket = Self::word_at(words, 0, "bucket name")?;
        let key = Self::word_at(words, 1, "key")?;
        let path = if let Some(idx) = words.iter().position(|w| w.text.eq_ignore_ascii_case("revision")) {
            let revision = Self::word_at(words, idx + 1, "revision number")?;
            format!("/api/v1/kv/buckets/{bucket}/keys/{key}/revision/{revision}")
        } else {
            format!("/api/v1/kv/buckets/{bucket}/keys/{key}")
        };
        let body = self.send_json(self.request(reqwest::Method::GET, &path)).await?;
        self.print_json(&body);
        Ok(1)
    }

    /// `DEL <bucket> <key>` tombstones a KV key; `DEL <bucket>` drops the
    /// bucket itself; `DEL OBJECT <bucket> <name>` deletes an object.
    async fn do_del(&self, words: &[Word]) -> Result<i64> {
        if words.first().is_some_and(|w| w.kind == TokenKind::OBJECT) {
            let bucket = Self::word_at(words, 1, "bucket name")?;
            let name = Self::word_at(words, 2, "object name")?;
            let path = format!("/api/v1/objects/buckets/{bucket}/objects/{name}");
            self.send_json(self.request(reqwest::Method::DELETE, &path)).await?;
            return Ok(1);
        }

        let bucket = Self::word_at(words, 0, "bucket name")?;
        match words.get(1) {
            Some(key) => {
                let path = format!("/api/v1/kv/buckets/{bucket}/keys/{}", key.text);
                let body = self.send_json(self.request(reqwest::Method::DELETE, &path)).await?;
                self.print_json(&body);
                Ok(1)
            }
            None => {
                let path = format!("/api/v1/kv/buckets/{bucket}");
                self.send_json(self.request(reqwest::Method::DELETE, &path)).await?;
                Ok(1)
            }
        }
    }

    async fn do_purge(&self, words: &[Word]) -> Result<i64> {
        if words.first().is_some_and(|w| w.kind == TokenKind::BUCKET) {
            let bucket = Self::word_at(words, 1, "bucket name")?;
            let path = format!("/api/v1/kv/buckets/{bucket}/purge");
            let body = self.send_json(self.request(reqwest::Method::DELETE, &path)).await?;
            let count = body.get("count").and_then(Value::as_i64).unwrap_or(0);
            self.print_json(&body);
            return Ok(count);
        }
        let bucket = Self::word_at(words, 0, "bucket name")?;
        let key = Self::word_at(words, 1, "key")?;
        let path = format!("/api/v1/kv/buckets/{bucket}/keys/{key}/purge");
        let body = self.send_json(self.request(reqwest::Method::DELETE, &path)).await?;
        let count = body.get("count").and_then(Value::as_i64).unwrap_or(0);
        self.print_json(&body);
        Ok(count)
    }

    async fn do_history(&self, words: &[Word]) -> Result<i64> {
        let bucket = Self::word_at(words, 0, "bucket name")?;
        let key = Self::word_at(words, 1, "key")?;
        let mut path = format!("/api/v1/kv/buckets/{bucket}/keys/{key}/history");
        if let Some(idx) = words.iter().position(|w| w.text.eq_ignore_ascii_case("limit")) {
            let limit = Self::word_at(words, idx + 1, "limit")?;
            path = format!("{path}?limit={limit}");
        }
        let body = self.send_json(self.request(reqwest::Method::GET, &path)).await?;
        let count = body.as_array().map(Vec::len).unwrap_or(0) as i64;
        self.print_json(&body);
        Ok(count)
    }

    async fn do_verify(&self, words: &[Word]) -> Result<i64> {
        let bucket = Self::word_at(words, 0, "bucket name")?;
        let name = Self::word_at(words, 1, "object name")?;
        let path = format!("/api/v1/objects/buckets/{bucket}/objects/{name}/verify");
        let body = self.send_json(self.request(reqwest::Method::GET, &path)).await?;
        self.print_json(&body);
        Ok(1)
    }

    async fn do_upload(&self, words: &[Word]) -> Result<i64> {
        let bucket = Self::word_at(words, 0, "bucket name")?;
        let name = Self::word_at(words, 1, "object name")?;
        let local_path = Self::word_at(words, 2, "local file path")?;
        let bytes = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("reading {local_path}"))?;
        let path = format!("/api/v1/objects/buckets/{bucket}/objects/{name}");
        let req = self
            .request(reqwest::Method::PUT, &path)
            .header("content-type", "application/octet-stream")
            .body(bytes);
        let body = self.send_json(req).await?;
        self.print_json(&body);
        Ok(1)
    }

    async fn do_download(&self, words: &[Word]) -> Result<i64> {
        let bucket = Self::word_at(words, 0, "bucket name")?;
        let name = Self::word_at(words, 1, "object name")?;
        let local_path = Self::word_at(words, 2, "local file path")?;
        let path = format!("/api/v1/objects/buckets/{bucket}/objects/{name}");
        let mut req = self.request(reqwest::Method::GET, &path);
        if let Some(idx) = words.iter().position(|w| w.kind == TokenKind::RANGE) {
            let range = Self::word_at(words, idx + 1, "byte range (e.g. 0-99)")?;
            req = req.header("range", format!("bytes={range}"));
        }
        let resp = req.send().await.context("downloading object")?;
        if !resp.status().is_success() {
            bail!("download failed ({})", resp.status());
        }
        let bytes = resp.bytes().await.context("reading download body")?;
        tokio::fs::write(local_path, &bytes)
            .await
            .with_context(|| format!("writing {local_path}"))?;
        println!("{} {} bytes to {}", "wrote".green(), bytes.len(), local_path);
        Ok(1)
    }

    /// `WATCH <bucket> [<key>]` watches a KV bucket or a single key;
    /// `WATCH OBJECT <bucket>` watches an object bucket.
    async fn do_watch(&self, words: &[Word]) -> Result<i64> {
        let object = words.first().is_some_and(|w| w.kind == TokenKind::OBJECT);
        let path = if object {
            let bucket = Self::word_at(words, 1, "bucket name")?;
            format!("/api/v1/objects/watch/{bucket}")
        } else {
            let bucket = Self::word_at(words, 0, "bucket name")?;
            match words.get(1) {
                Some(key) => format!("/api/v1/kv/watch/{bucket}/{}", key.text),
                None => format!("/api/v1/kv/watch/{bucket}"),
            }
        };

        let ws_url = self.url(&path).replacen("http", "ws", 1);
        let mut request = tokio_tungstenite::tungstenite::http::Request::builder()
            .uri(&ws_url)
            .header("Host", url_host(&ws_url))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            );
        if let Some(tenant) = &self.config.tenant {
            request = request.header("x-tenant-id", tenant);
        }
        let request = request.body(()).context("building watch request")?;

        let (mut stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .context("connecting watch socket")?;

        println!("{}", "watching -- press Ctrl+C to stop".dimmed());
        let mut count = 0i64;
        while let Some(message) = stream.next().await {
            match message {
                Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        self.print_json(&value);
                    } else {
                        println!("{text}");
                    }
                    count += 1;
                }
                Ok(tokio_tungstenite::tungstenite::Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    println!("{} {e}", "watch error:".red());
                    break;
                }
            }
        }
        let _ = stream.send(tokio_tungstenite::tungstenite::Message::Close(None)).await;
        Ok(count)
    }
}

fn url_host(url: &str) -> String {
    url.split("//").nth(1).and_then(|rest| rest.split('/').next()).unwrap_or("").to_string()
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("50% off"), "50%25%20off");
        assert_eq!(urlencode("plain"), "plain");
    }

    #[test]
    fn words_strips_quotes_and_skips_terminators() {
        let parsed = words("set mybucket mykey 'hello world';").unwrap();
        let texts: Vec<_> = parsed.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec!["set", "mybucket", "mykey", "hello world"]);
    }

    #[test]
    fn query_kind_resolves_known_keywords() {
        assert_eq!(QueryKind::try_from(TokenKind::WATCH).unwrap(), QueryKind::Watch);
        assert_eq!(QueryKind::try_from(TokenKind::PURGE).unwrap(), QueryKind::Purge);
        assert!(QueryKind::try_from(TokenKind::Plus).is_err());
    }
}
