use std::{fmt, path::Path, time::Instant};

use axum::{extract::Request, middleware::Next, response::Response};
use chrono::{SecondsFormat, Utc};
use tracing::{info, Event, Subscriber};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter,
};

pub const MAX_LOG_FILES: usize = 5;

/// `<timestamp> <LEVEL> <message>`, the line shape downstream parsers expect.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "{} {} ",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Maps configured level names (including `WARNING`/`CRITICAL`) to filter directives.
pub fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" | "CRITICAL" => "error",
        _ => "info",
    }
}

/// Console logging, plus a non-blocking copy in `destination` when given.
/// `RUST_LOG` overrides `level`. Keep the returned guard alive until exit so
/// buffered file lines are flushed.
pub fn init_logging(level: &str, destination: Option<&Path>) -> std::io::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));

    let console = tracing_subscriber::fmt::layer().event_format(LineFormat);

    let (file, guard) = match destination {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(path)?);
            let layer = tracing_subscriber::fmt::layer()
                .event_format(LineFormat)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();

    Ok(guard)
}

/// Daily-rotated log file named after `path`, keeping the newest
/// [`MAX_LOG_FILES`] files.
pub fn file_appender(path: &Path) -> std::io::Result<RollingFileAppender> {
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(directory)?;
    let file_name = path.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("log destination {} has no file name", path.display()),
        )
    })?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name.to_string_lossy())
        .max_log_files(MAX_LOG_FILES)
        .build(directory)
        .map_err(std::io::Error::other)
}

pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started_at = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started_at.elapsed().as_millis();

    info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = elapsed_ms,
        "request summary"
    );

    response
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        sync::{Arc, Mutex},
    };

    use chrono::DateTime;
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;
    use crate::audit::{testing::status, AuditSink, LogLineSink};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().expect("buffer lock").clone()).expect("utf-8 log output")
        }
    }

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("buffer lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn maps_config_level_names() {
        assert_eq!(level_directive("INFO"), "info");
        assert_eq!(level_directive("warning"), "warn");
        assert_eq!(level_directive("CRITICAL"), "error");
        assert_eq!(level_directive(" Debug "), "debug");
        assert_eq!(level_directive("verbose"), "info");
    }

    #[tokio::test]
    async fn status_record_renders_full_line() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .event_format(LineFormat)
            .with_writer(captured.clone())
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let sink = LogLineSink::new();
        sink.record_status(&status("web", "active", true))
            .await
            .expect("status logged");
        sink.record_status(&status("db", "inactive", false))
            .await
            .expect("status logged");

        let text = captured.text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let (timestamp, rest) = lines[0].split_once(' ').expect("timestamp separator");
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok(), "{timestamp}");
        assert!(timestamp.ends_with('Z'));
        assert_eq!(rest, "INFO [web] status=active active=true");

        let (_, rest) = lines[1].split_once(' ').expect("timestamp separator");
        assert_eq!(rest, "WARN [db] status=inactive active=false");
    }

    #[test]
    fn file_appender_creates_prefixed_file_in_new_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("logs").join("service_monitor.log");

        let mut appender = file_appender(&path).expect("appender builds");
        appender.write_all(b"line\n").expect("write log line");
        appender.flush().expect("flush log line");

        let names: Vec<String> = std::fs::read_dir(dir.path().join("logs"))
            .expect("log directory")
            .map(|entry| entry.expect("dir entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("service_monitor.log"), "{names:?}");
    }

    #[test]
    fn destination_without_file_name_is_rejected() {
        let err = file_appender(Path::new("/")).expect_err("no file name");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
