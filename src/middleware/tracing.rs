use axum::{extract::Request, middleware::Next, response::Response};
use std::fmt;
use std::time::Instant;
use tracing::field::Field;
use tracing::Instrument;
use tracing_subscriber::field::Visit;
use tracing_subscriber::fmt::format::Writer;
use uuid::Uuid;

/// Runs each request inside a `request` span with a fresh id.
pub async fn trace_requests(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let span = tracing::info_span!(
        "request",
        method = %request.method(),
        uri = %request.uri(),
        request_id = %request_id,
    );

    async move {
        let started = Instant::now();
        let response = next.run(request).await;
        // Streaming bodies are still being written at this point.
        tracing::info!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );
        response
    }
    .instrument(span)
    .await
}

/// Field formatter that colors the fields this service logs most.
pub struct ColoredFields;

impl<'writer> tracing_subscriber::fmt::FormatFields<'writer> for ColoredFields {
    fn format_fields<R: tracing_subscriber::field::RecordFields>(
        &self,
        writer: Writer<'writer>,
        fields: R,
    ) -> fmt::Result {
        let mut visitor = ColoredFieldVisitor::new(writer);
        fields.record(&mut visitor);
        visitor.finish()
    }
}

struct ColoredFieldVisitor<'writer> {
    writer: Writer<'writer>,
    is_first: bool,
    error: Option<fmt::Error>,
}

impl<'writer> ColoredFieldVisitor<'writer> {
    fn new(writer: Writer<'writer>) -> Self {
        Self {
            writer,
            is_first: true,
            error: None,
        }
    }

    fn finish(self) -> fmt::Result {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn write_field(&mut self, field: &Field, value: &dyn fmt::Debug) -> fmt::Result {
        if !self.is_first {
            write!(self.writer, " ")?;
        }
        self.is_first = false;

        if field.name() == "message" {
            return write!(self.writer, "{value:?}");
        }

        if !self.writer.has_ansi_escapes() {
            return write!(self.writer, "{}={:?}", field.name(), value);
        }

        let (key_color, value_color) = match field.name() {
            "request_id" => ("38;2;255;105;180", "36"),
            "stream_id" => ("38;2;255;105;180", "1;35"),
            "user_id" => ("34", "31"),
            "seq" => ("1;31", "1;37"),
            "status" => ("33", "32"),
            "uri" => ("35", "1;36"),
            "method" => ("1;33", "36"),
            _ => ("90", "37"),
        };
        write!(
            self.writer,
            "\x1b[{key_color}m{}=\x1b[{value_color}m{:?}\x1b[0m",
            field.name(),
            value
        )
    }
}

impl<'writer> Visit for ColoredFieldVisitor<'writer> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.write_field(field, value) {
            self.error = Some(err);
        }
    }
}
