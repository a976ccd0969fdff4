use super::helpers::{RankCtx, pattern, post_recv, run_local, run_ranks, send_bytes};
use skein::{AttrIn, LocalPmi, ProgressMode, Request, SkeinConfig, TransportAttr};

const LEN: usize = 4096;

/// Rank 0 sends `LEN` bytes to rank 1 on `ep`; returns what rank 1 got.
fn ping(ctx: &RankCtx<'_>, ep: usize, tag: u64) -> Option<(usize, bool)> {
    let t = ctx.transport;
    match ctx.rank() {
        0 => {
            let data = pattern(LEN, 3);
            let mut req = send_bytes(t, ep, &data, 1, tag);
            assert!(t.wait(ep, &mut req).is_success());
            assert!(req.is_completed());
            None
        }
        1 => {
            let mut buf = vec![0u8; LEN];
            let mut req = post_recv(t, ep, &mut buf, 0, tag);
            assert!(t.wait(ep, &mut req).is_success());
            Some((req.recv_len(), buf == pattern(LEN, 3)))
        }
        _ => None,
    }
}

#[test]
fn test_send_recv_same_host() {
    let out = run_local(2, |ctx| ping(ctx, 0, 7));
    assert_eq!(out[1], Some((LEN, true)));
}

#[test]
fn test_send_recv_network_only() {
    let attr = TransportAttr {
        input: AttrIn {
            enable_shm: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let out = run_ranks(LocalPmi::group(2), SkeinConfig::default(), attr, |ctx| {
        assert!(!ctx.attr.output.enable_shm);
        assert!(!ctx.transport.providers().provs[0].is_shm());
        ping(ctx, 0, 11)
    });
    assert_eq!(out[1], Some((LEN, true)));
}

#[test]
fn test_send_recv_across_hosts() {
    let pmis = LocalPmi::group_on_hosts(&["left", "right"]);
    let out = run_ranks(pmis, SkeinConfig::default(), TransportAttr::default(), |ctx| {
        ping(ctx, 0, 5)
    });
    assert_eq!(out[1], Some((LEN, true)));
}

#[test]
fn test_second_endpoint() {
    let attr = TransportAttr {
        input: AttrIn {
            ep_count: 3,
            ..Default::default()
        },
        ..Default::default()
    };
    let out = run_ranks(LocalPmi::group(2), SkeinConfig::default(), attr, |ctx| {
        assert_eq!(ctx.transport.ep_count(), 3);
        ping(ctx, 2, 1)
    });
    assert_eq!(out[1], Some((LEN, true)));
}

#[test]
fn test_short_message_reports_len() {
    let out = run_local(2, |ctx| {
        let t = ctx.transport;
        if ctx.rank() == 0 {
            let data = pattern(100, 9);
            let mut req = send_bytes(t, 0, &data, 1, 3);
            assert!(t.wait(0, &mut req).is_success());
            return 0;
        }
        let mut buf = vec![0u8; 100];
        let mut req = post_recv(t, 0, &mut buf, 0, 3);
        assert!(t.wait(0, &mut req).is_success());
        req.recv_len()
    });
    assert_eq!(out[1], 100);
}

#[test]
fn test_wait_all_in_tag_order() {
    let out = run_local(2, |ctx| {
        let t = ctx.transport;
        if ctx.rank() == 0 {
            let msgs: Vec<Vec<u8>> = (0..4).map(|i| pattern(64, i)).collect();
            let mut reqs: Vec<Request> = msgs
                .iter()
                .enumerate()
                .map(|(i, m)| send_bytes(t, 0, m, 1, 100 + i as u64))
                .collect();
            assert!(t.wait_all(0, &mut reqs).is_success());
            return true;
        }
        let mut bufs = vec![vec![0u8; 64]; 4];
        // post in reverse so matching goes by tag, not arrival
        let mut reqs: Vec<Request> = bufs
            .iter_mut()
            .enumerate()
            .rev()
            .map(|(i, b)| post_recv(t, 0, b, 0, 100 + i as u64))
            .collect();
        assert!(t.wait_all(0, &mut reqs).is_success());
        assert!(reqs.iter().all(Request::is_completed));
        bufs.iter().enumerate().all(|(i, b)| *b == pattern(64, i as u8))
    });
    assert!(out[1]);
}

#[test]
fn test_truncated_recv_fails_only_itself() {
    let out = run_local(2, |ctx| {
        let t = ctx.transport;
        if ctx.rank() == 0 {
            ctx.barrier();
            let msgs: Vec<Vec<u8>> = (1..=3).map(|i| pattern(8, i)).collect();
            let mut reqs: Vec<Request> = msgs
                .iter()
                .enumerate()
                .map(|(i, m)| send_bytes(t, 0, m, 1, 1 + i as u64))
                .collect();
            assert!(t.wait_all(0, &mut reqs).is_success());
            return (true, true, true);
        }
        let mut short_buf = vec![0u8; 4];
        let mut healthy_buf = vec![0u8; 8];
        let mut short = post_recv(t, 0, &mut short_buf, 0, 1);
        let mut healthy = post_recv(t, 0, &mut healthy_buf, 0, 2);
        ctx.barrier();

        // the truncation is drained while waiting on the healthy receive
        let healthy_ok = t.wait(0, &mut healthy).is_success() && healthy_buf == pattern(8, 2);
        let short_failed = !t.wait(0, &mut short).is_success();
        assert!(short.is_completed());
        assert!(!short.in_flight());

        // the failed handle is reusable
        let mut again_buf = vec![0u8; 8];
        // SAFETY: waited on below while `again_buf` is alive.
        let status = unsafe {
            t.recv(0, again_buf.as_mut_ptr() as u64, again_buf.len(), 0, 3, &mut short)
        };
        let reused = status.is_success()
            && t.wait(0, &mut short).is_success()
            && again_buf == pattern(8, 3);
        (healthy_ok, short_failed, reused)
    });
    assert_eq!(out[1], (true, true, true));
}

#[test]
fn test_check_drives_progress_in_check_mode() {
    let out = run_local(2, |ctx| {
        let t = ctx.transport;
        assert_eq!(t.progress_mode(), ProgressMode::Check);
        if ctx.rank() == 0 {
            ctx.barrier();
            let data = pattern(32, 1);
            let mut req = send_bytes(t, 0, &data, 1, 9);
            assert!(t.wait(0, &mut req).is_success());
            return 0;
        }
        let mut buf = vec![0u8; 32];
        let mut req = post_recv(t, 0, &mut buf, 0, 9);
        ctx.barrier();
        let mut checks = 0;
        while !req.is_completed() {
            assert!(t.check(0, &mut req).is_success());
            checks += 1;
        }
        assert_eq!(buf, pattern(32, 1));
        checks
    });
    assert!(out[1] >= 1);
}

#[test]
fn test_poll_mode() {
    let config = SkeinConfig {
        progress_mode: Some(ProgressMode::Poll),
        ..SkeinConfig::default()
    };
    let out = run_ranks(LocalPmi::group(2), config, TransportAttr::default(), |ctx| {
        let t = ctx.transport;
        assert_eq!(t.progress_mode(), ProgressMode::Poll);
        if ctx.rank() == 0 {
            let data = pattern(48, 2);
            let mut req = send_bytes(t, 0, &data, 1, 4);
            assert!(t.wait(0, &mut req).is_success());
            return true;
        }
        let mut buf = vec![0u8; 48];
        let mut req = post_recv(t, 0, &mut buf, 0, 4);
        while !req.is_completed() {
            assert!(t.poll(0).is_success());
            assert!(t.check(0, &mut req).is_success());
        }
        buf == pattern(48, 2)
    });
    assert!(out[1]);
}

#[test]
fn test_unknown_peer_fails() {
    let out = run_local(1, |ctx| {
        let data = [0u8; 4];
        let mut req = Request::new();
        // SAFETY: the call fails before touching the buffer.
        let status = unsafe {
            ctx.transport
                .send(0, data.as_ptr() as u64, data.len(), 5, 0, &mut req)
        };
        (status.is_success(), req.in_flight())
    });
    assert_eq!(out[0], (false, false));
}
