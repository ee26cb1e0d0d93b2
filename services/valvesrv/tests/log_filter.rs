//! Runtime log filter changes through the service facade

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use ::common::logging::{self, LogConfig};
use common::{start_with_peer, test_config};
use errors::ValveErrorTrait;

#[tokio::test]
async fn test_log_filter_follows_reloads() {
    let (service, _transport, _peer) = start_with_peer(test_config());

    let err = service.set_log_filter("debug").unwrap_err();
    assert_eq!(err.error_code(), "INVALID_CONFIG");
    assert_eq!(service.log_filter(), None);

    logging::init_with_config(LogConfig {
        filter: "warn".to_string(),
        enable_file: false,
        ansi: false,
        ..Default::default()
    })
    .unwrap();
    assert!(service.log_filter().is_some());

    service.set_log_filter("info,valvesrv=debug").unwrap();
    assert_eq!(service.log_filter().as_deref(), Some("info,valvesrv=debug"));

    let err = service.set_log_filter("valvesrv=loud").unwrap_err();
    assert!(err.to_string().contains("logging.level"), "{}", err);
    assert_eq!(service.log_filter().as_deref(), Some("info,valvesrv=debug"));

    service.shutdown().await;
}
