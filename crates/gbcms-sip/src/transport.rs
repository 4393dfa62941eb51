// SIP 传输适配层
// UDP/TCP 同端口监听，入站按方法分发，出站支持客户端事务等待响应

use crate::error::{Result, SipError};
use crate::message::{SipMessage, SipRequest, SipResponse};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, RwLock};

/// 传输协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
}

impl Transport {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Some(Transport::Udp),
            "TCP" => Some(Transport::Tcp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "UDP",
            Transport::Tcp => "TCP",
        }
    }
}

/// 入站请求处理器。每条请求在独立任务中回调。
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, req: SipRequest, addr: SocketAddr, transport: Transport);
}

/// 客户端事务：发送请求后由此读取响应。
/// 丢弃时自动注销挂起表，调用方负责超时。
pub struct ClientTransaction {
    call_id: String,
    rx: mpsc::Receiver<SipResponse>,
    pending: Arc<DashMap<String, mpsc::Sender<SipResponse>>>,
}

impl ClientTransaction {
    /// 等待任意一条响应（含 1xx）
    pub async fn recv(&mut self, timeout: Duration) -> Result<SipResponse> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(resp)) => Ok(resp),
            Ok(None) => Err(SipError::Transport("transaction channel closed".to_string())),
            Err(_) => Err(SipError::Timeout),
        }
    }

    /// 等待最终响应（>=200），1xx 跳过。整体受 timeout 约束。
    pub async fn recv_final(&mut self, timeout: Duration) -> Result<SipResponse> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(SipError::Timeout)?;
            let resp = self.recv(remaining).await?;
            if resp.status_code >= 200 {
                return Ok(resp);
            }
        }
    }
}

impl Drop for ClientTransaction {
    fn drop(&mut self) {
        self.pending.remove(&self.call_id);
    }
}

/// SIP 传输适配器。重启（rebind）期间持有套接字写锁，其他发送阻塞等待。
pub struct SipTransport {
    udp: RwLock<Option<Arc<UdpSocket>>>,
    tcp_conns: Arc<DashMap<SocketAddr, mpsc::Sender<String>>>,
    pending: Arc<DashMap<String, mpsc::Sender<SipResponse>>>,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    stop_tx: RwLock<Option<watch::Sender<bool>>>,
}

impl SipTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            udp: RwLock::new(None),
            tcp_conns: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            handler: RwLock::new(None),
            stop_tx: RwLock::new(None),
        })
    }

    pub async fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.handler.write().await = Some(handler);
    }

    /// 绑定 UDP+TCP 并启动接收循环
    pub async fn bind(self: &Arc<Self>, listen_ip: &str, port: u16) -> Result<()> {
        let bind_addr = format!("{}:{}", listen_ip, port);
        let udp = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|e| SipError::Transport(format!("bind UDP {}: {}", bind_addr, e)))?;
        let tcp = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| SipError::Transport(format!("bind TCP {}: {}", bind_addr, e)))?;

        tracing::info!(target: "gbcms::sip", addr = %bind_addr, "SIP transport listening (UDP+TCP)");

        let udp = Arc::new(udp);
        *self.udp.write().await = Some(udp.clone());

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.write().await = Some(stop_tx);

        let this = self.clone();
        let mut stop = stop_rx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    recv = udp.recv_from(&mut buf) => match recv {
                        Ok((len, addr)) => {
                            let data = buf[..len].to_vec();
                            let this = this.clone();
                            tokio::spawn(async move {
                                this.handle_incoming(data, addr, Transport::Udp).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!(target: "gbcms::sip", "UDP recv failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!(target: "gbcms::sip", "UDP receive loop stopped");
        });

        let this = self.clone();
        let mut stop = stop_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    accepted = tcp.accept() => match accepted {
                        Ok((stream, addr)) => {
                            this.clone().register_tcp_stream(stream, addr);
                        }
                        Err(e) => {
                            tracing::error!(target: "gbcms::sip", "TCP accept failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!(target: "gbcms::sip", "TCP accept loop stopped");
        });

        Ok(())
    }

    /// 停止接收循环并释放端口
    pub async fn shutdown(&self) {
        if let Some(tx) = self.stop_tx.write().await.take() {
            let _ = tx.send(true);
        }
        *self.udp.write().await = None;
        self.tcp_conns.clear();
    }

    /// 关闭并重新绑定。重启语义（关流、停级联）由上层编排。
    pub async fn rebind(self: &Arc<Self>, listen_ip: &str, port: u16) -> Result<()> {
        self.shutdown().await;
        self.bind(listen_ip, port).await
    }

    fn register_tcp_stream(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (mut rd, mut wr) = stream.into_split();
        let (tx, mut out_rx) = mpsc::channel::<String>(32);
        self.tcp_conns.insert(addr, tx);

        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if let Err(e) = wr.write_all(data.as_bytes()).await {
                    tracing::warn!(target: "gbcms::sip", remote = %addr, "TCP write failed: {}", e);
                    break;
                }
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::with_capacity(8192);
            let mut chunk = vec![0u8; 8192];
            loop {
                match rd.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        while let Some((msg, consumed)) = frame_message(&buf) {
                            let this = this.clone();
                            tokio::spawn(async move {
                                this.handle_incoming(msg, addr, Transport::Tcp).await;
                            });
                            buf.drain(..consumed);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(target: "gbcms::sip", remote = %addr, "TCP read failed: {}", e);
                        break;
                    }
                }
            }
            this.tcp_conns.remove(&addr);
            tracing::debug!(target: "gbcms::sip", remote = %addr, "TCP connection closed");
        });
    }

    async fn handle_incoming(&self, data: Vec<u8>, addr: SocketAddr, transport: Transport) {
        let text = String::from_utf8_lossy(&data).to_string();
        if text.trim().is_empty() {
            // 心跳保活用的 CRLF
            return;
        }

        let message = match SipMessage::from_string(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(target: "gbcms::sip", remote = %addr, "SIP parse failed: {}", e);
                return;
            }
        };

        match message {
            SipMessage::Request(req) => {
                let handler = self.handler.read().await.clone();
                if let Some(handler) = handler {
                    handler.handle_request(req, addr, transport).await;
                } else {
                    tracing::warn!(target: "gbcms::sip", "no request handler installed");
                }
            }
            SipMessage::Response(resp) => {
                let Some(call_id) = resp.call_id().map(|s| s.to_string()) else {
                    return;
                };
                if let Some(tx) = self.pending.get(&call_id) {
                    if tx.try_send(resp).is_err() {
                        tracing::debug!(target: "gbcms::sip", %call_id, "response channel full, dropped");
                    }
                } else {
                    tracing::debug!(target: "gbcms::sip", %call_id, code = resp.status_code, "unmatched response");
                }
            }
        }
    }

    /// 原始发送
    pub async fn send(&self, data: &str, addr: SocketAddr, transport: Transport) -> Result<()> {
        match transport {
            Transport::Udp => {
                let udp = self
                    .udp
                    .read()
                    .await
                    .clone()
                    .ok_or_else(|| SipError::Transport("UDP socket not bound".to_string()))?;
                udp.send_to(data.as_bytes(), addr)
                    .await
                    .map_err(|e| SipError::Transport(format!("UDP send to {}: {}", addr, e)))?;
            }
            Transport::Tcp => {
                let tx = match self.tcp_conns.get(&addr) {
                    Some(tx) => tx.clone(),
                    None => self.connect_tcp(addr).await?,
                };
                tx.send(data.to_string())
                    .await
                    .map_err(|_| SipError::Transport(format!("TCP conn to {} closed", addr)))?;
            }
        }
        Ok(())
    }

    async fn connect_tcp(&self, addr: SocketAddr) -> Result<mpsc::Sender<String>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SipError::Transport(format!("TCP connect {}: {}", addr, e)))?;
        // register_tcp_stream 需要 Arc<Self>，出站连接单独挂接
        let (mut rd, mut wr) = stream.into_split();
        let (tx, mut out_rx) = mpsc::channel::<String>(32);
        self.tcp_conns.insert(addr, tx.clone());

        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if wr.write_all(data.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let pending = self.pending.clone();
        let conns = self.tcp_conns.clone();
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::with_capacity(8192);
            let mut chunk = vec![0u8; 8192];
            loop {
                match rd.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        while let Some((msg, consumed)) = frame_message(&buf) {
                            let text = String::from_utf8_lossy(&msg).to_string();
                            if let Ok(SipMessage::Response(resp)) = SipMessage::from_string(&text) {
                                if let Some(call_id) = resp.call_id().map(|s| s.to_string()) {
                                    if let Some(tx) = pending.get(&call_id) {
                                        let _ = tx.try_send(resp);
                                    }
                                }
                            }
                            buf.drain(..consumed);
                        }
                    }
                }
            }
            conns.remove(&addr);
        });

        Ok(tx)
    }

    /// 发起客户端事务：注册 Call-ID 挂起表并发送
    pub async fn send_request(
        &self,
        req: &SipRequest,
        addr: SocketAddr,
        transport: Transport,
    ) -> Result<ClientTransaction> {
        let call_id = req
            .call_id()
            .ok_or(SipError::MissingHeader("Call-ID"))?
            .to_string();
        let (tx, rx) = mpsc::channel(8);
        self.pending.insert(call_id.clone(), tx);

        let result = self.send(&req.to_string(), addr, transport).await;
        if let Err(e) = result {
            self.pending.remove(&call_id);
            return Err(e);
        }

        Ok(ClientTransaction {
            call_id,
            rx,
            pending: self.pending.clone(),
        })
    }

    /// 发送请求并等待最终响应
    pub async fn request_reply(
        &self,
        req: &SipRequest,
        addr: SocketAddr,
        transport: Transport,
        timeout: Duration,
    ) -> Result<SipResponse> {
        let mut tx = self.send_request(req, addr, transport).await?;
        tx.recv_final(timeout).await
    }

    /// 发送响应
    pub async fn send_response(
        &self,
        resp: &SipResponse,
        addr: SocketAddr,
        transport: Transport,
    ) -> Result<()> {
        self.send(&resp.to_string(), addr, transport).await?;
        tracing::debug!(
            target: "gbcms::sip",
            remote = %addr,
            code = resp.status_code,
            "sent SIP response"
        );
        Ok(())
    }

    /// 不等待响应的发送（ACK 等）
    pub async fn send_oneway(
        &self,
        req: &SipRequest,
        addr: SocketAddr,
        transport: Transport,
    ) -> Result<()> {
        self.send(&req.to_string(), addr, transport).await
    }
}

/// TCP 流式解帧：按 `\r\n\r\n` + Content-Length 切出完整报文。
/// 返回 (报文字节, 消耗长度)。
fn frame_message(buf: &[u8]) -> Option<(Vec<u8>, usize)> {
    let header_end = buf.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let header_text = String::from_utf8_lossy(&buf[..header_end]);
    let mut content_length = 0usize;
    for line in header_text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    let total = header_end + content_length;
    if buf.len() < total {
        return None;
    }
    Some((buf[..total].to_vec(), total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SipMethod;

    #[test]
    fn test_frame_message_with_body() {
        let msg = b"MESSAGE sip:a@b SIP/2.0\r\nCall-ID: 1\r\nContent-Length: 5\r\n\r\nhello";
        let mut buf = msg.to_vec();
        buf.extend_from_slice(b"REGIS"); // 下一条的前缀

        let (frame, consumed) = frame_message(&buf).unwrap();
        assert_eq!(consumed, msg.len());
        assert!(frame.ends_with(b"hello"));
        assert!(frame_message(&buf[consumed..]).is_none());
    }

    #[test]
    fn test_frame_message_incomplete() {
        let partial = b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 10\r\n\r\nhel";
        assert!(frame_message(partial).is_none());
    }

    #[tokio::test]
    async fn test_udp_request_response_roundtrip() {
        struct Echo;
        #[async_trait]
        impl RequestHandler for Echo {
            async fn handle_request(&self, _req: SipRequest, _addr: SocketAddr, _t: Transport) {}
        }

        let server = SipTransport::new();
        server.bind("127.0.0.1", 0).await.unwrap();
        // 端口 0 不可寻址，此处仅验证绑定与停止流程
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_client_transaction_between_two_transports() {
        // a 作为 UAC，b 作为 UAS
        let a = SipTransport::new();
        let b = SipTransport::new();

        // 选取固定的回环端口对，避免依赖端口发现
        let a_port = 15070u16;
        let b_port = 15071u16;
        a.bind("127.0.0.1", a_port).await.unwrap();
        b.bind("127.0.0.1", b_port).await.unwrap();

        struct Ok200 {
            transport: Arc<SipTransport>,
        }
        #[async_trait]
        impl RequestHandler for Ok200 {
            async fn handle_request(&self, req: SipRequest, addr: SocketAddr, t: Transport) {
                let resp = SipResponse::for_request(200, "OK", &req);
                let _ = self.transport.send_response(&resp, addr, t).await;
            }
        }
        b.set_handler(Arc::new(Ok200 { transport: b.clone() })).await;

        let mut req = SipRequest::new(SipMethod::Message, "sip:test@127.0.0.1");
        req.add_header("Via", format!("SIP/2.0/UDP 127.0.0.1:{};branch=z9hG4bK1", a_port));
        req.add_header("From", "<sip:a@dom>;tag=1");
        req.add_header("To", "<sip:b@dom>");
        req.add_header("Call-ID", "tx-test-1");
        req.add_header("CSeq", "1 MESSAGE");

        let dest: SocketAddr = format!("127.0.0.1:{}", b_port).parse().unwrap();
        let resp = a
            .request_reply(&req, dest, Transport::Udp, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(resp.status_code, 200);

        a.shutdown().await;
        b.shutdown().await;
    }
}
