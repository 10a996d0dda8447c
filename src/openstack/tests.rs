//! Unit tests for the HTTP client and its wire payloads.

use std::net::{IpAddr, Ipv4Addr};

use rstest::rstest;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::protocol::{InterfaceAttachBody, InterfaceEnvelope, ServerEnvelope, error_message};
use super::*;

fn config(compute: &str) -> CloudConfig {
    CloudConfig {
        auth_token: String::from("tok-123"),
        compute_endpoint: compute.to_owned(),
        image_endpoint: None,
        network_endpoint: None,
        volume_endpoint: None,
        image_id: None,
        image_name: None,
        flavor_id: None,
        flavor_name: None,
        poll_interval_secs: 3,
        poll_min_delay_secs: 10,
        build_retry_attempts: 3,
    }
}

fn header_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|position| position + 4)
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Serves one canned response and returns the raw request it received.
async fn serve_once(status: &'static str, body: String) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind listener: {err}"));
    let address = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("listener address: {err}"));
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener
            .accept()
            .await
            .unwrap_or_else(|err| panic!("accept: {err}"));
        let mut received = Vec::new();
        let mut chunk = [0_u8; 4096];
        loop {
            let read = stream
                .read(&mut chunk)
                .await
                .unwrap_or_else(|err| panic!("read request: {err}"));
            received.extend(chunk.iter().take(read));
            if let Some(end) = header_end(&received) {
                let head = String::from_utf8_lossy(received.get(..end).unwrap_or_default());
                if received.len() >= end + content_length(&head) || read == 0 {
                    break;
                }
            }
            if read == 0 {
                break;
            }
        }
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        stream
            .write_all(response.as_bytes())
            .await
            .unwrap_or_else(|err| panic!("write response: {err}"));
        String::from_utf8_lossy(&received).into_owned()
    });
    (format!("http://{address}/v2.1/project-1"), handle)
}

#[rstest]
#[case::missing(404, "NotFound")]
#[case::conflict(409, "Conflict")]
#[case::throttled(429, "Unavailable")]
#[case::server_error(503, "Unavailable")]
#[case::bad_request(400, "Rejected")]
#[case::forbidden(403, "Rejected")]
fn statuses_are_classified(#[case] status: u16, #[case] expected: &str) {
    let error = classify_status(status, "", Target::new("server", "srv-1"));
    let label = match error {
        ApiError::NotFound { .. } => "NotFound",
        ApiError::Conflict { .. } => "Conflict",
        ApiError::Unavailable { .. } => "Unavailable",
        ApiError::Rejected { .. } => "Rejected",
        ApiError::Transport { .. } | ApiError::Decode { .. } => "other",
    };
    assert_eq!(label, expected);
}

#[test]
fn fault_message_is_unwrapped() {
    let body = r#"{"conflictingRequest": {"message": "Instance is locked", "code": 409}}"#;
    assert_eq!(error_message(body), "Instance is locked");
    assert_eq!(error_message("  upstream timeout \n"), "upstream timeout");
}

#[test]
fn volume_backed_server_has_no_image() {
    let envelope: ServerEnvelope = serde_json::from_value(json!({
        "server": {
            "id": "srv-1",
            "name": "web-1",
            "status": "ACTIVE",
            "OS-EXT-AZ:availability_zone": "nova",
            "image": "",
            "flavor": { "id": "flv-1" },
            "accessIPv4": "",
            "accessIPv6": "",
            "metadata": { "role": "web" },
            "security_groups": [{ "name": "default" }, { "name": "default" }],
            "addresses": {
                "private": [
                    { "addr": "10.0.0.5", "version": 4, "OS-EXT-IPS-MAC:mac_addr": "fa:16:3e:00:00:05" }
                ]
            }
        }
    }))
    .unwrap_or_else(|err| panic!("server should decode: {err}"));

    let record = ServerRecord::from(envelope.server);

    assert_eq!(record.image_id, None);
    assert_eq!(record.flavor_id.as_deref(), Some("flv-1"));
    assert_eq!(record.access_ip_v4, None);
    assert_eq!(record.security_groups, vec![String::from("default")]);
    assert!(matches!(
        record.addresses.as_slice(),
        [address] if address.network_name == "private"
            && address.addr == IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))
    ));
}

#[test]
fn interface_payload_maps_to_record() {
    let envelope: InterfaceEnvelope = serde_json::from_value(json!({
        "interfaceAttachment": {
            "port_id": "port-1",
            "net_id": "net-1",
            "mac_addr": "fa:16:3e:00:00:09",
            "port_state": "ACTIVE",
            "fixed_ips": [{ "ip_address": "10.0.0.9", "subnet_id": "sub-1" }]
        }
    }))
    .unwrap_or_else(|err| panic!("interface should decode: {err}"));

    let record = InterfaceRecord::from(envelope.interface);

    assert_eq!(record.network_id, "net-1");
    assert_eq!(record.fixed_ips, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))]);
}

#[test]
fn volume_tracking_follows_volume_endpoint() {
    let without = NovaClient::new(&config("https://compute.example/v2.1"));
    let with = NovaClient::new(&CloudConfig {
        volume_endpoint: Some(String::from("https://volume.example/v3/project-1")),
        ..config("https://compute.example/v2.1")
    });

    assert!(!without.tracks_volumes());
    assert!(with.tracks_volumes());
}

#[test]
fn attach_body_names_only_the_port() {
    let request = InterfaceRequest {
        port_id: String::from("port-1"),
    };

    let body = serde_json::to_value(InterfaceAttachBody {
        interface: &request,
    })
    .unwrap_or_else(|err| panic!("body should encode: {err}"));

    assert_eq!(body, json!({ "interfaceAttachment": { "port_id": "port-1" } }));
}

#[test]
fn path_segments_are_escaped() {
    let url = endpoint_url("https://compute.example/v2.1/", &["servers", "srv-1", "metadata", "a/b"])
        .unwrap_or_else(|err| panic!("url should build: {err}"));

    assert_eq!(
        url.as_str(),
        "https://compute.example/v2.1/servers/srv-1/metadata/a%2Fb"
    );
}

#[test]
fn debug_output_omits_token() {
    let client = NovaClient::new(&config("https://compute.example/v2.1"));
    assert!(!format!("{client:?}").contains("tok-123"));
}

#[tokio::test]
async fn lookups_without_endpoint_fail_before_sending() {
    let client = NovaClient::new(&config("https://compute.example/v2.1"));

    let error = client
        .network_ids_by_name("private")
        .await
        .expect_err("lookup should fail without an endpoint");

    assert!(error.to_string().contains("OS_NETWORK_ENDPOINT"), "{error}");
}

#[tokio::test]
async fn tag_replacement_sends_token_and_microversion() {
    let (endpoint, server) = serve_once("200 OK", json!({ "tags": ["a", "b"] }).to_string()).await;
    let client = NovaClient::new(&config(&endpoint));
    let tags = BTreeSet::from([String::from("a"), String::from("b")]);

    let replaced = client
        .replace_tags("srv-1", &tags, Microversion::TAGS)
        .await
        .unwrap_or_else(|err| panic!("replace should succeed: {err}"));
    let request = server
        .await
        .unwrap_or_else(|err| panic!("server task: {err}"))
        .to_ascii_lowercase();

    assert_eq!(replaced, tags);
    assert!(request.starts_with("put /v2.1/project-1/servers/srv-1/tags "), "{request}");
    assert!(request.contains("x-auth-token: tok-123"), "{request}");
    assert!(request.contains("x-openstack-nova-api-version: 2.26"), "{request}");
    assert!(request.contains("x-openstack-request-id: req-"), "{request}");
}

#[tokio::test]
async fn missing_server_maps_to_not_found() {
    let body = json!({ "itemNotFound": { "message": "Instance could not be found", "code": 404 } });
    let (endpoint, server) = serve_once("404 Not Found", body.to_string()).await;
    let client = NovaClient::new(&config(&endpoint));

    let error = client
        .get_server("srv-9")
        .await
        .expect_err("missing server should fail");
    let request = server
        .await
        .unwrap_or_else(|err| panic!("server task: {err}"))
        .to_ascii_lowercase();

    assert_eq!(error, ApiError::not_found("server", "srv-9"));
    assert!(
        !request.contains("x-openstack-nova-api-version"),
        "plain reads carry no microversion: {request}"
    );
}
