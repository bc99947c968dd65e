//! Prefix comparison properties.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use pfkey::key::SecurityIndex;
use pfkey::key::index::{bits_equal, prefix_match};

fn samples() -> Vec<IpAddr> {
    vec![
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        IpAddr::V4(Ipv4Addr::new(10, 255, 0, 128)),
        IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
        IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0x1, 0x2, 0x3, 0x4)),
    ]
}

fn octets(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}

#[test]
fn test_address_matches_itself_at_every_width() {
    for addr in samples() {
        let width = octets(&addr).len() * 8;
        for bits in 0..=width {
            assert!(prefix_match(&addr, &addr, bits as u8), "{addr}/{bits}");
        }
    }
}

#[test]
fn test_flipped_bit_inside_prefix_breaks_match() {
    for addr in samples() {
        let a = octets(&addr);
        let width = a.len() * 8;
        for flip in 0..width {
            let mut b = a.clone();
            b[flip / 8] ^= 0x80 >> (flip % 8);
            for bits in 0..=width {
                let expect = bits <= flip;
                assert_eq!(
                    bits_equal(&a, &b, bits as u8),
                    expect,
                    "{addr} flip {flip} prefix {bits}"
                );
            }
        }
    }
}

#[test]
fn test_families_never_match() {
    let v4: IpAddr = "192.0.2.1".parse().unwrap();
    let v6: IpAddr = "::ffff:192.0.2.1".parse().unwrap();
    assert!(!prefix_match(&v4, &v6, 0));
    assert!(!prefix_match(&v6, &v4, 0));
}

#[test]
fn test_selector_wildcards() {
    let net: IpAddr = "10.0.0.0".parse().unwrap();
    let host: IpAddr = "10.1.2.3".parse().unwrap();
    let dst: IpAddr = "192.0.2.1".parse().unwrap();

    let pattern = SecurityIndex::prefixes(net, 8, dst, 32);
    let concrete = SecurityIndex::host(host, dst).with_proto(6).with_ports(1024, 443);
    assert!(pattern.matches(&concrete));

    let tcp_only = SecurityIndex::prefixes(net, 8, dst, 32)
        .with_proto(6)
        .with_ports(0, 443);
    assert!(tcp_only.matches(&concrete));

    let udp_only = SecurityIndex::prefixes(net, 8, dst, 32).with_proto(17);
    assert!(!udp_only.matches(&concrete));

    let other_port = SecurityIndex::prefixes(net, 8, dst, 32).with_ports(0, 22);
    assert!(!other_port.matches(&concrete));
}
