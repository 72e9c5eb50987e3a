pub mod judge;

pub async fn healthz() -> &'static str {
    "ok"
}
