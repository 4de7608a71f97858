use std::io::Write;
use std::sync::LazyLock;

use regex::Regex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Stderr writer that masks credentials before they are written.
pub struct RedactingWriter<W> {
    inner: W,
}

impl RedactingWriter<std::io::Stderr> {
    pub fn stderr() -> Self {
        Self {
            inner: std::io::stderr(),
        }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let original = String::from_utf8_lossy(buf);
        self.inner.write_all(redact_secrets(&original).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<'a> MakeWriter<'a> for RedactingWriter<std::io::Stderr> {
    type Writer = RedactingWriter<std::io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::stderr()
    }
}

static SECRET_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?x)
          (?i:bearer)\s+[A-Za-z0-9._~+/=_-]{8,}      # authorization headers
        | sk-[A-Za-z0-9_\-]{20,}                      # OpenAI-style keys
        | "(?:session_token|api_key|token)"\s*:\s*"[^"]+"   # JSON credential fields
        "#,
    )
    .expect("redaction regex should compile")
});

/// Replace credential-looking substrings with `[REDACTED]`.
pub fn redact_secrets(input: &str) -> String {
    SECRET_PATTERNS.replace_all(input, "[REDACTED]").into_owned()
}

/// `RUST_LOG` wins; otherwise `verbose` picks the level.
pub fn init(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(RedactingWriter::stderr())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_bearer_header() {
        assert_eq!(
            redact_secrets("authorization: Bearer abc123def456"),
            "authorization: [REDACTED]"
        );
    }

    #[test]
    fn redacts_api_key() {
        assert_eq!(
            redact_secrets("key=sk-1234567890abcdefghijklmn"),
            "key=[REDACTED]"
        );
    }

    #[test]
    fn redacts_json_token_field() {
        assert_eq!(
            redact_secrets(r#"{"token": "s3cret", "user": "u1"}"#),
            r#"{[REDACTED], "user": "u1"}"#
        );
    }

    #[test]
    fn leaves_normal_text_unchanged() {
        assert_eq!(redact_secrets("reply finished in 12ms"), "reply finished in 12ms");
    }

    #[test]
    fn writer_redacts_before_inner_write() {
        let mut writer = RedactingWriter { inner: Vec::new() };
        writer.write_all(b"using Bearer tok_0123456789\n").unwrap();
        assert_eq!(String::from_utf8(writer.inner).unwrap(), "using [REDACTED]\n");
    }
}
