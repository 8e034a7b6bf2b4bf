use super::*;

#[test]
fn test_port_only() {
    let spec = ForwardSpec::parse("3000").unwrap();
    assert_eq!(spec.local_addr(), "0.0.0.0:3000");
    assert_eq!(spec.remote_addr().as_deref(), Some("127.0.0.1:3000"));
    assert_eq!(spec.protocol, Protocol::Tcp);
    assert!(!spec.reverse);
    assert!(!spec.socks);
    assert!(!spec.stdio);
}

#[test]
fn test_port_and_remote() {
    let spec = ForwardSpec::parse("3000:google.com:80").unwrap();
    assert_eq!(spec.local_addr(), "0.0.0.0:3000");
    assert_eq!(spec.remote_addr().as_deref(), Some("google.com:80"));
    assert_eq!(spec.protocol, Protocol::Tcp);
}

#[test]
fn test_full_rule() {
    let spec = ForwardSpec::parse("192.168.0.5:3000:google.com:80").unwrap();
    assert_eq!(spec.local_host, "192.168.0.5");
    assert_eq!(spec.local_port, Some(3000));
    assert_eq!(spec.remote_host, "google.com");
    assert_eq!(spec.remote_port, Some(80));
}

#[test]
fn test_reverse() {
    let spec = ForwardSpec::parse("R:2222:localhost:22").unwrap();
    assert!(spec.reverse);
    assert_eq!(spec.local_port, Some(2222));
    assert_eq!(spec.remote_addr().as_deref(), Some("localhost:22"));
    assert_eq!(spec.access_target(), "R:0.0.0.0:2222");
}

#[test]
fn test_udp() {
    let spec = ForwardSpec::parse("1.1.1.1:53/udp").unwrap();
    assert_eq!(spec.protocol, Protocol::Udp);
    assert_eq!(spec.remote_addr().as_deref(), Some("1.1.1.1:53"));
    assert_eq!(spec.local_addr(), "0.0.0.0:53");
    assert_eq!(spec.channel_metadata().as_deref(), Some("1.1.1.1:53/udp"));
}

#[test]
fn test_protocol_suffix_is_case_insensitive() {
    let spec = ForwardSpec::parse("5353:10.0.0.1:53/UDP").unwrap();
    assert_eq!(spec.protocol, Protocol::Udp);
}

#[test]
fn test_socks_and_stdio_individually() {
    let socks = ForwardSpec::parse("R:socks").unwrap();
    assert!(socks.reverse);
    assert!(socks.socks);
    assert_eq!(socks.local_addr(), "127.0.0.1:1080");
    assert_eq!(socks.remote_addr(), None);
    assert_eq!(socks.channel_metadata().as_deref(), Some("socks"));

    let stdio = ForwardSpec::parse("stdio").unwrap();
    assert!(stdio.stdio);
    assert!(!stdio.reverse);

    let rules = parse_all(["R:socks", "stdio"]).unwrap();
    assert_eq!(rules.len(), 2);
}

#[test]
fn test_socks_with_local_port() {
    let spec = ForwardSpec::parse("5000:socks").unwrap();
    assert!(spec.socks);
    assert_eq!(spec.local_addr(), "127.0.0.1:5000");
}

#[test]
fn test_stdio_with_remote() {
    let spec = ForwardSpec::parse("stdio:example.com:22").unwrap();
    assert!(spec.stdio);
    assert_eq!(spec.remote_addr().as_deref(), Some("example.com:22"));
    assert_eq!(spec.encode(), "stdio:example.com:22");
}

#[test]
fn test_reverse_stdio_rejected() {
    let err = ForwardSpec::parse("R:stdio:example.com:22").unwrap_err();
    assert!(matches!(err, SpecError::ReverseStdio(_)));
}

#[test]
fn test_cross_protocol_rejected() {
    let err = ForwardSpec::parse("3000/tcp:example.com:53/udp").unwrap_err();
    assert!(matches!(err, SpecError::CrossProtocol(_)));
}

#[test]
fn test_socks_over_udp_rejected() {
    let err = ForwardSpec::parse("1080/udp:socks").unwrap_err();
    assert!(matches!(err, SpecError::SocksOverUdp(_)));
}

#[test]
fn test_bad_token_counts() {
    assert!(matches!(
        ForwardSpec::parse("").unwrap_err(),
        SpecError::TokenCount(_)
    ));
    assert!(matches!(
        ForwardSpec::parse("1:2:3:4:5").unwrap_err(),
        SpecError::TokenCount(_)
    ));
}

#[test]
fn test_invalid_host_and_port() {
    assert!(matches!(
        ForwardSpec::parse("3000:bad host:80").unwrap_err(),
        SpecError::InvalidHost { .. }
    ));
    assert!(matches!(
        ForwardSpec::parse("70000").unwrap_err(),
        SpecError::InvalidPort { .. }
    ));
    assert!(matches!(
        ForwardSpec::parse("example.com").unwrap_err(),
        SpecError::MissingPort { .. }
    ));
}

#[test]
fn test_bracketed_ipv6() {
    let spec = ForwardSpec::parse("[::1]:8080:[2001:db8::1]:80").unwrap();
    assert_eq!(spec.local_host, "[::1]");
    assert_eq!(spec.local_port, Some(8080));
    assert_eq!(spec.remote_host, "[2001:db8::1]");
    assert_eq!(spec.remote_addr().as_deref(), Some("[2001:db8::1]:80"));

    assert!(matches!(
        ForwardSpec::parse("[::1:8080").unwrap_err(),
        SpecError::Brackets(_)
    ));
}

#[test]
fn test_normalized_round_trip() {
    let rules = [
        "3000",
        "3000:google.com:80",
        "192.168.0.5:3000:google.com:80",
        "R:2222:localhost:22",
        "R:0.0.0.0:8080:10.0.0.1:80",
        "1.1.1.1:53/udp",
        "5353:1.1.1.1:53/udp",
        "R:5353:[::1]:53/udp",
        "socks",
        "R:socks",
        "5000:socks",
        "stdio",
        "stdio:example.com:22",
        "[::1]:8080:[2001:db8::1]:80",
    ];
    for rule in rules {
        let first = ForwardSpec::parse(rule).unwrap();
        let encoded = first.encode();
        let second = ForwardSpec::parse(&encoded)
            .unwrap_or_else(|e| panic!("{} encoded as {} failed: {}", rule, encoded, e));
        assert_eq!(first, second, "{} => {}", rule, encoded);
    }
}

#[test]
fn test_display_elides_default_hosts() {
    assert_eq!(ForwardSpec::parse("3000").unwrap().to_string(), "3000=>3000");
    assert_eq!(
        ForwardSpec::parse("3000:google.com:80").unwrap().to_string(),
        "3000=>google.com:80"
    );
    assert_eq!(
        ForwardSpec::parse("R:socks").unwrap().to_string(),
        "R:127.0.0.1:1080=>socks"
    );
    assert_eq!(
        ForwardSpec::parse("1.1.1.1:53/udp").unwrap().to_string(),
        "53=>1.1.1.1:53/udp"
    );
}

#[test]
fn test_parse_target() {
    assert_eq!(
        parse_target("example.com:80").unwrap(),
        Target::Tcp("example.com:80".into())
    );
    assert_eq!(
        parse_target("1.1.1.1:53/udp").unwrap(),
        Target::Udp("1.1.1.1:53".into())
    );
    assert_eq!(parse_target("socks").unwrap(), Target::Socks);
    assert!(parse_target("example.com").is_err());
    assert!(parse_target("example.com:0").is_err());
}

#[test]
fn test_can_listen_on_ephemeral_port() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let busy = ForwardSpec::parse(&format!("127.0.0.1:{}:example.com:80", port)).unwrap();
    assert!(!busy.can_listen());

    drop(taken);
    assert!(busy.can_listen());
}
