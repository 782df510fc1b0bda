use crawlpool::ProxyEntry;

#[test]
fn plain_line_registers_both_protocols() {
    let entry = ProxyEntry::from_line("1.2.3.4:8080").unwrap();
    assert_eq!(entry.http.as_deref(), Some("http://1.2.3.4:8080"));
    assert_eq!(entry.https.as_deref(), Some("https://1.2.3.4:8080"));
}

#[test]
fn protocol_suffix_registers_one_slot() {
    let entry = ProxyEntry::from_line("1.2.3.4:8080:http").unwrap();
    assert_eq!(entry.http.as_deref(), Some("http://1.2.3.4:8080"));
    assert!(entry.https.is_none());

    let entry = ProxyEntry::from_line("1.2.3.4:8080:https").unwrap();
    assert!(entry.http.is_none());
    assert_eq!(entry.https.as_deref(), Some("https://1.2.3.4:8080"));
}

#[test]
fn credentials_survive_parsing() {
    let entry = ProxyEntry::from_line("user:pass@1.2.3.4:8080").unwrap();
    assert_eq!(entry.identity(), "user:pass@1.2.3.4:8080");
}

#[test]
fn blank_and_comment_lines_are_skipped() {
    assert!(ProxyEntry::from_line("").is_none());
    assert!(ProxyEntry::from_line("   ").is_none());
    assert!(ProxyEntry::from_line("# 1.2.3.4:8080").is_none());
}

#[test]
fn identity_round_trips_through_from_id() {
    let entry = ProxyEntry::from_line("5.6.7.8:3128").unwrap();
    let id = entry.identity();
    assert_eq!(id, "5.6.7.8:3128");
    let rebuilt = ProxyEntry::from_id(&id);
    assert_eq!(rebuilt.identity(), id);
    assert_eq!(rebuilt.http.as_deref(), Some("http://5.6.7.8:3128"));
    assert_eq!(rebuilt.https.as_deref(), Some("https://5.6.7.8:3128"));
}

#[test]
fn host_and_port_come_from_identity() {
    let entry = ProxyEntry::from_line("user:pass@9.9.9.9:1080").unwrap();
    assert_eq!(entry.host().as_deref(), Some("9.9.9.9"));
    assert_eq!(entry.port(), Some(1080));
}

#[test]
fn any_url_prefers_encrypted() {
    let entry = ProxyEntry::from_id("1.1.1.1:80");
    assert_eq!(entry.any_url(), Some("https://1.1.1.1:80"));
    let entry = ProxyEntry::from_line("1.1.1.1:80:http").unwrap();
    assert_eq!(entry.any_url(), Some("http://1.1.1.1:80"));
}
