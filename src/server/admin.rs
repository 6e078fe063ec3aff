use super::{full_body, AppContext, BoxBody};
use hyper::body::Incoming;
use hyper::{Request, Response};

pub fn handle_admin(
    req: Request<Incoming>,
    ctx: AppContext,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => Ok(Response::builder()
            .status(200)
            .body(full_body(format!(
                r#"{{"status":"ready","routing_url":"{}"}}"#,
                ctx.config.routing.url,
            )))
            .unwrap()),

        "/metrics" => Ok(Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(ctx.metrics.render()))
            .unwrap()),

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
