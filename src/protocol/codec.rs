use super::message::{AckCode, Request, Response};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Marker closing every message ("EOS\0").
pub const END_OF_MESSAGE: u32 = 0x454F_5300;
/// Largest accepted argument, guards against a corrupt length prefix.
pub const MAX_ARG_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("expected ack {expected}, got {got}")]
    UnexpectedAck { expected: u32, got: u32 },

    #[error("expected end-of-message marker, got {0:#010x}")]
    MissingEndMarker(u32),

    #[error("argument of {0} bytes exceeds the frame limit")]
    Oversized(u32),

    #[error("expected {expected} arguments, got {got}")]
    ArgCount { expected: usize, got: usize },

    #[error("argument is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed value: {0}")]
    BadValue(String),

    /// The peer answered with an error ack. The frame was fully consumed.
    #[error("remote error: {0}")]
    Remote(String),
}

impl ProtocolError {
    /// Remote errors leave the connection in sync; everything else does not.
    pub fn is_remote(&self) -> bool {
        matches!(self, ProtocolError::Remote(_))
    }
}

// --- Encoding ---

fn put_args<A: AsRef<[u8]>>(buf: &mut Vec<u8>, args: &[A]) {
    buf.extend_from_slice(&(args.len() as u32).to_be_bytes());
    for arg in args {
        let arg = arg.as_ref();
        buf.extend_from_slice(&(arg.len() as u32).to_be_bytes());
        buf.extend_from_slice(arg);
    }
}

pub fn encode_request(request: &Request) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + request.args.iter().map(|a| a.len() + 4).sum::<usize>());
    buf.extend_from_slice(&request.code.to_be_bytes());
    put_args(&mut buf, &request.args);
    buf.extend_from_slice(&END_OF_MESSAGE.to_be_bytes());
    buf
}

pub fn encode_response(response: &Response) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + response.args.iter().map(|a| a.len() + 4).sum::<usize>());
    buf.extend_from_slice(&response.ack.code().to_be_bytes());
    put_args(&mut buf, &response.args);
    buf.extend_from_slice(&END_OF_MESSAGE.to_be_bytes());
    buf
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &Request,
) -> Result<(), ProtocolError> {
    writer.write_all(&encode_request(request)).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> Result<(), ProtocolError> {
    writer.write_all(&encode_response(response)).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_stream_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    record_count: u32,
) -> Result<(), ProtocolError> {
    writer.write_u32(AckCode::Stream.code()).await?;
    writer.write_u32(record_count).await?;
    Ok(())
}

pub async fn write_stream_record<W: AsyncWrite + Unpin, A: AsRef<[u8]>>(
    writer: &mut W,
    fields: &[A],
) -> Result<(), ProtocolError> {
    let mut buf = Vec::new();
    put_args(&mut buf, fields);
    writer.write_all(&buf).await?;
    Ok(())
}

pub async fn write_stream_end<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), ProtocolError> {
    writer.write_u32(END_OF_MESSAGE).await?;
    writer.flush().await?;
    Ok(())
}

// --- Decoding ---

async fn read_args<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let argc = reader.read_u32().await?;
    let mut args = Vec::with_capacity((argc as usize).min(1024));
    for _ in 0..argc {
        let len = reader.read_u32().await?;
        if len > MAX_ARG_LEN {
            return Err(ProtocolError::Oversized(len));
        }
        let mut arg = vec![0u8; len as usize];
        reader.read_exact(&mut arg).await?;
        args.push(arg);
    }
    Ok(args)
}

pub async fn read_end_marker<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(), ProtocolError> {
    let marker = reader.read_u32().await?;
    if marker != END_OF_MESSAGE {
        return Err(ProtocolError::MissingEndMarker(marker));
    }
    Ok(())
}

/// Reads the next request. `Ok(None)` means the peer closed the connection
/// cleanly between requests.
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Request>, ProtocolError> {
    let code = match reader.read_u32().await {
        Ok(code) => code,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let args = read_args(reader)
        .await?
        .into_iter()
        .map(|arg| String::from_utf8(arg).map_err(|_| ProtocolError::InvalidUtf8))
        .collect::<Result<Vec<_>, _>>()?;
    read_end_marker(reader).await?;

    Ok(Some(Request { code, args }))
}

async fn read_error_body<R: AsyncRead + Unpin>(reader: &mut R) -> ProtocolError {
    let args = match read_args(reader).await {
        Ok(args) => args,
        Err(e) => return e,
    };
    if let Err(e) = read_end_marker(reader).await {
        return e;
    }
    let message = args
        .first()
        .map(|raw| String::from_utf8_lossy(raw).into_owned())
        .unwrap_or_default();
    ProtocolError::Remote(message)
}

/// Reads a single response, which must carry `AckCode::Ok`.
pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Response, ProtocolError> {
    let ack = reader.read_u32().await?;
    match AckCode::from_code(ack) {
        Some(AckCode::Ok) => {}
        Some(AckCode::Error) => return Err(read_error_body(reader).await),
        _ => {
            return Err(ProtocolError::UnexpectedAck {
                expected: AckCode::Ok.code(),
                got: ack,
            });
        }
    }

    let args = read_args(reader).await?;
    read_end_marker(reader).await?;
    Ok(Response {
        ack: AckCode::Ok,
        args,
    })
}

/// Reads the header of a streaming reply and returns the declared record count.
pub async fn read_stream_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32, ProtocolError> {
    let ack = reader.read_u32().await?;
    match AckCode::from_code(ack) {
        Some(AckCode::Stream) => Ok(reader.read_u32().await?),
        Some(AckCode::Error) => Err(read_error_body(reader).await),
        _ => Err(ProtocolError::UnexpectedAck {
            expected: AckCode::Stream.code(),
            got: ack,
        }),
    }
}

pub async fn read_stream_record<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<String>, ProtocolError> {
    read_args(reader)
        .await?
        .into_iter()
        .map(|field| String::from_utf8(field).map_err(|_| ProtocolError::InvalidUtf8))
        .collect()
}
