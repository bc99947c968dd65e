//! SPI allocation limits.

use pfkey::key::{
    Direction, Error, IpsecProtocol, Sadb, SecurityAssociation, SecurityIndex, SpiAllocator,
    SpiRangeExt,
};

use crate::common::{my, peer};

/// An SADB holding Larval inbound SAs with these SPIs.
fn occupied(protocol: IpsecProtocol, spis: &[u32]) -> Sadb {
    let mut sadb = Sadb::new();
    let group = sadb
        .create_saidx(SecurityIndex::host(peer(), my()), Direction::Inbound)
        .unwrap();
    for &spi in spis {
        sadb.insert_sa(SecurityAssociation::larval(spi, protocol, group, 0))
            .unwrap();
    }
    sadb
}

#[test]
fn test_forced_spi_in_use_fails_every_time() {
    let sadb = occupied(IpsecProtocol::Ah, &[100]);
    let mut spi = SpiAllocator::with_seed(1, 0x100, 0x0fff_ffff, 1000);
    let range = SpiRangeExt { min: 100, max: 100 };

    for _ in 0..2 {
        let err = spi.allocate(Some(&range), IpsecProtocol::Ah, &sadb).unwrap_err();
        assert!(err.is_already_exists(), "{err}");
    }
    // The same value is free for another protocol.
    assert_eq!(spi.allocate(Some(&range), IpsecProtocol::Esp, &sadb).unwrap(), 100);
}

#[test]
fn test_exhausted_range_gives_up_after_trycnt() {
    let sadb = occupied(IpsecProtocol::Esp, &[0x200, 0x201, 0x202]);
    let mut spi = SpiAllocator::with_seed(7, 0x100, 0x0fff_ffff, 17);
    let range = SpiRangeExt {
        min: 0x200,
        max: 0x202,
    };

    match spi.allocate(Some(&range), IpsecProtocol::Esp, &sadb) {
        Err(Error::NoSpiAvailable { attempts }) => assert_eq!(attempts, 17),
        other => panic!("expected NoSpiAvailable, got {other:?}"),
    }
    assert_eq!(spi.stats().allocations, 0);
}

#[test]
fn test_allocation_stays_in_range() {
    let sadb = occupied(IpsecProtocol::Esp, &[0x1000]);
    let mut spi = SpiAllocator::with_seed(3, 0x100, 0x0fff_ffff, 1000);
    let range = SpiRangeExt {
        min: 0x1000,
        max: 0x1003,
    };
    for _ in 0..20 {
        let got = spi.allocate(Some(&range), IpsecProtocol::Esp, &sadb).unwrap();
        assert!((0x1001..=0x1003).contains(&got), "{got:#x}");
    }
    assert_eq!(spi.stats().allocations, 20);
}

#[test]
fn test_ipcomp_range_clamped_to_cpi() {
    let sadb = Sadb::new();
    let mut spi = SpiAllocator::with_seed(9, 0x100, 0x0fff_ffff, 1000);
    let range = SpiRangeExt {
        min: 0x1_0000,
        max: 0x2_0000,
    };
    assert_eq!(
        spi.allocate(Some(&range), IpsecProtocol::IpComp, &sadb).unwrap(),
        0xffff
    );
}
