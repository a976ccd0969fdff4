use super::helpers::{RankCtx, pattern, run_local, run_ranks};
use skein::{LocalPmi, Request, SkeinConfig, TransportAttr};

const REGION: usize = 256;

/// Publish this rank's registration and fetch the peer's `(addr, key)`.
fn swap_keys(ctx: &RankCtx<'_>, addr: u64, key: u64) -> (u64, u64) {
    let mut value = addr.to_le_bytes().to_vec();
    value.extend_from_slice(&key.to_le_bytes());
    ctx.pmi.kvs_put(&format!("rma-test-{}", ctx.rank()), &value).unwrap();
    ctx.barrier();
    let peer = ctx.pmi.kvs_get(&format!("rma-test-{}", 1 - ctx.rank())).unwrap();
    let addr = u64::from_le_bytes(peer[..8].try_into().unwrap());
    let key = u64::from_le_bytes(peer[8..16].try_into().unwrap());
    (addr, key)
}

fn write_then_read(ctx: &RankCtx<'_>) -> Vec<u8> {
    let t = ctx.transport;
    let mut region = vec![0u8; REGION];
    if ctx.rank() == 1 {
        region[128..].copy_from_slice(&pattern(128, 50));
    }
    let base = region.as_mut_ptr() as u64;
    let mr = t.mr_reg(base, REGION).unwrap();
    assert_eq!(mr.len, REGION);
    let (peer_addr, peer_key) = swap_keys(ctx, base, mr.remote_key);

    if ctx.rank() == 0 {
        region[..64].copy_from_slice(&pattern(64, 20));
        let mut req = Request::new();
        // SAFETY: `region` outlives the wait below.
        let status = unsafe { t.write(0, base, 64, &mr, peer_addr, peer_key, 1, &mut req) };
        assert!(status.is_success());
        assert!(t.wait(0, &mut req).is_success());

        let mut req = Request::new();
        // SAFETY: as above.
        let status =
            unsafe { t.read(0, base + 64, 64, &mr, peer_addr + 128, peer_key, 1, &mut req) };
        assert!(status.is_success());
        assert!(t.wait(0, &mut req).is_success());
    }
    ctx.barrier();
    assert!(t.mr_dereg(mr).is_success());
    region
}

#[test]
fn test_write_then_read_same_host() {
    let out = run_local(2, write_then_read);
    assert_eq!(&out[1][..64], &pattern(64, 20)[..]);
    assert_eq!(&out[0][64..128], &pattern(128, 50)[..64]);
}

#[test]
fn test_write_then_read_across_hosts() {
    let pmis = LocalPmi::group_on_hosts(&["east", "west"]);
    let out = run_ranks(pmis, SkeinConfig::default(), TransportAttr::default(), write_then_read);
    assert_eq!(&out[1][..64], &pattern(64, 20)[..]);
    assert_eq!(&out[0][64..128], &pattern(128, 50)[..64]);
}

#[test]
fn test_rma_outside_registration_rejected() {
    let out = run_local(1, |ctx| {
        let t = ctx.transport;
        let mut region = vec![0u8; 64];
        let base = region.as_mut_ptr() as u64;
        let mr = t.mr_reg(base, 32).unwrap();
        let mut req = Request::new();
        // SAFETY: rejected before the buffer is used.
        let status = unsafe { t.write(0, base + 16, 32, &mr, base, mr.remote_key, 0, &mut req) };
        assert!(t.mr_dereg(mr).is_success());
        status.is_success()
    });
    assert!(!out[0]);
}
