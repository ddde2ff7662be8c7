use super::{ProbeError, ProbeTimeouts, ServerStatus, StatusProbe};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

/// Server List Ping 클라이언트 (Minecraft Java Edition)
///
/// SLP 프로토콜 명세:
/// - TCP 기반, 모든 패킷은 VarInt 길이 프리픽스 + VarInt 패킷 ID + 바디
/// - 핸드셰이크(0x00, next state = 1) → 상태 요청(0x00) → JSON 상태 응답
/// - 핑(0x01, i64 페이로드)은 서버가 그대로 에코하며 RTT 측정에 사용
#[derive(Debug, Clone, Default)]
pub struct SlpClient;

const DEFAULT_PORT: u16 = 25565;

/// 핸드셰이크 프로토콜 버전 -1: 버전 협상 없이 상태만 조회
const PROTOCOL_VERSION: i32 = -1;
const NEXT_STATE_STATUS: i32 = 1;

const PACKET_HANDSHAKE: i32 = 0x00;
const PACKET_STATUS: i32 = 0x00;
const PACKET_PING: i32 = 0x01;

/// 상태 응답 프레임 상한 — MOTD/파비콘 포함 JSON이므로 넉넉히 잡는다
const MAX_FRAME_LEN: usize = 256 * 1024;

/// 상태 응답 JSON (필요한 필드만)
#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    version: Option<StatusVersion>,
    #[serde(default)]
    players: Option<StatusPlayers>,
    #[serde(default)]
    description: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StatusVersion {
    name: String,
}

#[derive(Debug, Deserialize)]
struct StatusPlayers {
    online: u32,
    max: u32,
}

impl SlpClient {
    pub fn new() -> Self {
        Self
    }
}

impl StatusProbe for SlpClient {
    async fn probe(
        &self,
        address: &str,
        timeouts: ProbeTimeouts,
    ) -> Result<ServerStatus, ProbeError> {
        let (host, port) = parse_address(address)?;

        let stream = timeout(timeouts.connect, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| ProbeError::Timeout(timeouts.connect))?
            .map_err(|e| {
                ProbeError::ConnectionError(format!("Failed to connect to {}: {}", address, e))
            })?;

        match timeout(timeouts.probe, status_exchange(stream, &host, port)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(timeouts.probe)),
        }
    }
}

/// 핸드셰이크 → 상태 요청 → 핑 교환을 수행하고 상태 스냅샷 반환
async fn status_exchange(
    mut stream: TcpStream,
    host: &str,
    port: u16,
) -> Result<ServerStatus, ProbeError> {
    // 핸드셰이크: [ID][프로토콜 버전][호스트][포트][next state]
    let mut body = Vec::new();
    write_varint(&mut body, PACKET_HANDSHAKE);
    write_varint(&mut body, PROTOCOL_VERSION);
    write_string(&mut body, host);
    WriteBytesExt::write_u16::<BigEndian>(&mut body, port)
        .map_err(|e| ProbeError::Protocol(format!("Failed to encode handshake: {}", e)))?;
    write_varint(&mut body, NEXT_STATE_STATUS);
    send_frame(&mut stream, &body).await?;

    // 상태 요청 (바디 없음)
    let mut body = Vec::new();
    write_varint(&mut body, PACKET_STATUS);
    send_frame(&mut stream, &body).await?;

    // 상태 응답: [ID][JSON 길이][JSON]
    let frame = read_frame(&mut stream).await?;
    let mut cursor = &frame[..];
    let packet_id = read_varint(&mut cursor)?;
    if packet_id != PACKET_STATUS {
        return Err(ProbeError::Protocol(format!(
            "Unexpected status packet id: {:#04x}",
            packet_id
        )));
    }
    let json_len = read_varint(&mut cursor)?;
    if json_len < 0 || json_len as usize > cursor.len() {
        return Err(ProbeError::MalformedResponse(format!(
            "Invalid status length: {}",
            json_len
        )));
    }
    let mut json = vec![0u8; json_len as usize];
    std::io::Read::read_exact(&mut cursor, &mut json)
        .map_err(|e| ProbeError::MalformedResponse(format!("Truncated status body: {}", e)))?;
    let status: StatusResponse = serde_json::from_slice(&json)
        .map_err(|e| ProbeError::MalformedResponse(format!("Invalid status JSON: {}", e)))?;

    let players = status.players.ok_or_else(|| {
        ProbeError::MalformedResponse("Status response has no players object".to_string())
    })?;

    // 핑: i64 페이로드를 에코받아 RTT 측정
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let mut body = Vec::new();
    write_varint(&mut body, PACKET_PING);
    WriteBytesExt::write_i64::<BigEndian>(&mut body, nonce)
        .map_err(|e| ProbeError::Protocol(format!("Failed to encode ping: {}", e)))?;
    let sent = Instant::now();
    send_frame(&mut stream, &body).await?;

    let frame = read_frame(&mut stream).await?;
    let latency_ms = sent.elapsed().as_millis() as u64;
    let mut cursor = &frame[..];
    let packet_id = read_varint(&mut cursor)?;
    if packet_id != PACKET_PING {
        return Err(ProbeError::Protocol(format!(
            "Unexpected pong packet id: {:#04x}",
            packet_id
        )));
    }
    let echoed = ReadBytesExt::read_i64::<BigEndian>(&mut cursor)
        .map_err(|e| ProbeError::MalformedResponse(format!("Truncated pong payload: {}", e)))?;
    if echoed != nonce {
        return Err(ProbeError::Protocol(format!(
            "Pong payload mismatch: sent {}, got {}",
            nonce, echoed
        )));
    }

    Ok(ServerStatus {
        players_online: players.online,
        players_max: players.max,
        latency_ms,
        version: status.version.map(|v| v.name),
        motd: status.description.as_ref().and_then(description_text),
    })
}

/// VarInt 길이 프리픽스를 붙여 패킷 전송
async fn send_frame(stream: &mut TcpStream, body: &[u8]) -> Result<(), ProbeError> {
    let mut frame = Vec::with_capacity(body.len() + 5);
    write_varint(&mut frame, body.len() as i32);
    frame.extend_from_slice(body);
    stream
        .write_all(&frame)
        .await
        .map_err(|e| ProbeError::ConnectionError(format!("Failed to send packet: {}", e)))
}

/// VarInt 길이 프리픽스 프레임 수신
async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, ProbeError> {
    let len = read_varint_async(stream).await?;
    if len <= 0 || len as usize > MAX_FRAME_LEN {
        return Err(ProbeError::Protocol(format!("Invalid frame length: {}", len)));
    }
    let mut frame = vec![0u8; len as usize];
    stream
        .read_exact(&mut frame)
        .await
        .map_err(|e| ProbeError::ConnectionError(format!("Failed to read packet: {}", e)))?;
    Ok(frame)
}

fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut value = value as u32;
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as i32);
    buf.extend_from_slice(s.as_bytes());
}

fn read_varint(cursor: &mut &[u8]) -> Result<i32, ProbeError> {
    let mut value: u32 = 0;
    for i in 0..5 {
        let byte = ReadBytesExt::read_u8(cursor)
            .map_err(|e| ProbeError::MalformedResponse(format!("Truncated VarInt: {}", e)))?;
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(ProbeError::Protocol("VarInt longer than 5 bytes".to_string()))
}

async fn read_varint_async(stream: &mut TcpStream) -> Result<i32, ProbeError> {
    let mut value: u32 = 0;
    for i in 0..5 {
        let byte = stream
            .read_u8()
            .await
            .map_err(|e| ProbeError::ConnectionError(format!("Failed to read VarInt: {}", e)))?;
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(ProbeError::Protocol("VarInt longer than 5 bytes".to_string()))
}

/// `host[:port]` 주소 파싱, 기본 포트 25565
///
/// 브래킷 없는 콜론 다수는 IPv6 주소로 간주한다.
pub(crate) fn parse_address(address: &str) -> Result<(String, u16), ProbeError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ProbeError::InvalidAddress("empty address".to_string()));
    }

    // [IPv6]:port 형식
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ProbeError::InvalidAddress(address.to_string()))?;
        if host.is_empty() {
            return Err(ProbeError::InvalidAddress(address.to_string()));
        }
        let port = match tail.strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| ProbeError::InvalidAddress(address.to_string()))?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(ProbeError::InvalidAddress(address.to_string())),
        };
        return Ok((host.to_string(), port));
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return Err(ProbeError::InvalidAddress(address.to_string()));
            }
            let port = port
                .parse()
                .map_err(|_| ProbeError::InvalidAddress(address.to_string()))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((address.to_string(), DEFAULT_PORT)),
    }
}

/// 채팅 컴포넌트 형식의 MOTD에서 표시 텍스트 추출
fn description_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => {
            let mut out = String::new();
            if let Some(serde_json::Value::String(text)) = map.get("text") {
                out.push_str(text);
            }
            if let Some(serde_json::Value::Array(extra)) = map.get("extra") {
                for part in extra {
                    if let Some(text) = description_text(part) {
                        out.push_str(&text);
                    }
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(out)
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: i32) -> i32 {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        let mut cursor = &buf[..];
        read_varint(&mut cursor).unwrap()
    }

    #[test]
    fn test_varint_roundtrip() {
        for value in [0, 1, 127, 128, 255, 25565, 2097151, i32::MAX, -1, PROTOCOL_VERSION] {
            assert_eq!(roundtrip(value), value, "roundtrip failed for {}", value);
        }
    }

    #[test]
    fn test_varint_encoding_boundaries() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 127);
        assert_eq!(buf, vec![0x7F]);

        let mut buf = Vec::new();
        write_varint(&mut buf, 128);
        assert_eq!(buf, vec![0x80, 0x01]);

        // -1은 부호 없는 5바이트 인코딩
        let mut buf = Vec::new();
        write_varint(&mut buf, -1);
        assert_eq!(buf, vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
    }

    #[test]
    fn test_varint_too_long_rejected() {
        let raw = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        let mut cursor = &raw[..];
        assert!(read_varint(&mut cursor).is_err());
    }

    #[test]
    fn test_parse_address_forms() {
        assert_eq!(
            parse_address("mc.example.net").unwrap(),
            ("mc.example.net".to_string(), 25565)
        );
        assert_eq!(
            parse_address("mc.example.net:25570").unwrap(),
            ("mc.example.net".to_string(), 25570)
        );
        assert_eq!(
            parse_address("[2001:db8::1]:25566").unwrap(),
            ("2001:db8::1".to_string(), 25566)
        );
        assert_eq!(
            parse_address("2001:db8::1").unwrap(),
            ("2001:db8::1".to_string(), 25565)
        );
    }

    #[test]
    fn test_parse_address_rejects_garbage() {
        assert!(parse_address("").is_err());
        assert!(parse_address(":25565").is_err());
        assert!(parse_address("mc.example.net:notaport").is_err());
        assert!(parse_address("[2001:db8::1").is_err());
    }

    #[test]
    fn test_status_json_parsing() {
        let raw = r#"{
            "version": {"name": "Paper 1.21.4", "protocol": 769},
            "players": {"online": 17, "max": 200},
            "description": {"text": "Welcome to ", "extra": [{"text": "the server"}]}
        }"#;
        let status: StatusResponse = serde_json::from_str(raw).unwrap();
        let players = status.players.unwrap();
        assert_eq!(players.online, 17);
        assert_eq!(players.max, 200);
        assert_eq!(status.version.unwrap().name, "Paper 1.21.4");
        assert_eq!(
            description_text(&status.description.unwrap()),
            Some("Welcome to the server".to_string())
        );
    }

    #[test]
    fn test_description_plain_string() {
        let value = serde_json::json!("A Minecraft Server");
        assert_eq!(description_text(&value), Some("A Minecraft Server".to_string()));
    }
}
