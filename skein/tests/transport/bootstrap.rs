use super::helpers::{init_tracing, run_local, run_ranks};
use skein::fabric::shm::ShmHub;
use skein::{
    Fabric, KvsMode, LocalPmi, Pmi, ProgressMode, SkeinConfig, SkeinError, Transport, TransportAttr,
};
use std::sync::Arc;

#[test]
fn test_single_host_opens_shm_in_check_mode() {
    let out = run_local(4, |ctx| {
        let set = ctx.transport.providers();
        assert!(set.provs[0].is_shm());
        assert_eq!(set.nw_prov_first_idx, 1);
        assert_eq!(set.nw_prov_count, 1);
        assert!(ctx.attr.output.enable_shm);
        assert_eq!(ctx.attr.output.tag_bits, 64);
        assert_eq!(ctx.attr.output.max_tag, u64::MAX);
        assert!(!ctx.attr.output.enable_rma);
        assert_eq!(ctx.transport.size(), 4);
        assert_eq!(ctx.transport.coord().local_count, 4);
        (ctx.rank(), ctx.transport.progress_mode())
    });
    for (i, (rank, mode)) in out.into_iter().enumerate() {
        assert_eq!(rank as usize, i);
        assert_eq!(mode, ProgressMode::Check);
    }
}

#[test]
fn test_large_job_defaults_to_poll() {
    let out = run_local(5, |ctx| ctx.transport.progress_mode());
    assert!(out.iter().all(|m| *m == ProgressMode::Poll));
}

#[test]
fn test_two_hosts() {
    let pmis = LocalPmi::group_on_hosts(&["node-a", "node-b", "node-a", "node-b"]);
    let out = run_ranks(pmis, SkeinConfig::default(), TransportAttr::default(), |ctx| {
        let coord = ctx.transport.coord();
        assert_eq!(coord.local_count, 2);
        assert_eq!(coord.node_count, 2);
        ctx.transport.progress_mode()
    });
    assert!(out.iter().all(|m| *m == ProgressMode::Poll));
}

fn rank2proc_with(mode: KvsMode, hosts: &[&str]) -> Vec<Vec<usize>> {
    let config = SkeinConfig {
        kvs_mode: mode,
        ..SkeinConfig::default()
    };
    let attr = TransportAttr {
        input: skein::AttrIn {
            ep_count: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    run_ranks(LocalPmi::group_on_hosts(hosts), config, attr, |ctx| {
        ctx.transport.get_rank2proc_map().unwrap()
    })
}

#[test]
fn test_exchange_protocols_agree() {
    let hosts = ["h0", "h0", "h1", "h1", "h1"];
    let direct = rank2proc_with(KvsMode::Pmi, &hosts);
    let pmix = rank2proc_with(KvsMode::Pmix, &hosts);
    let shm = rank2proc_with(KvsMode::PmixShm, &hosts);
    for maps in [&direct, &pmix, &shm] {
        assert!(maps.iter().all(|m| *m == vec![0, 1, 2, 3, 4]));
    }
    assert_eq!(direct, shm);
}

#[test]
fn test_rank2proc_map_repeats() {
    let out = run_local(3, |ctx| {
        let first = ctx.transport.get_rank2proc_map().unwrap();
        let second = ctx.transport.get_rank2proc_map().unwrap();
        (first, second)
    });
    for (first, second) in out {
        assert_eq!(first, vec![0, 1, 2]);
        assert_eq!(first, second);
    }
}

#[test]
fn test_hostname_sharing() {
    let config = SkeinConfig {
        hostname_sharing: true,
        ..SkeinConfig::default()
    };
    let pmis = LocalPmi::group_on_hosts(&["alpha", "beta"]);
    let out = run_ranks(pmis, config, TransportAttr::default(), |ctx| {
        skein::addr::shared_hostname(ctx.pmi, KvsMode::Pmi, 1 - ctx.rank()).unwrap()
    });
    assert_eq!(out, vec!["beta-1".to_string(), "alpha-0".to_string()]);
}

#[test]
fn test_update_reexchanges() {
    let out = run_local(2, |ctx| {
        assert!(ctx.transport.update().is_success());
        ctx.transport.get_rank2proc_map().unwrap()
    });
    assert!(out.iter().all(|m| *m == vec![0, 1]));
}

#[test]
fn test_shm_only_rejects_multi_host() {
    init_tracing();
    let config = SkeinConfig {
        provider: Some("shm".into()),
        ..SkeinConfig::default()
    };
    let hub = ShmHub::new();
    let handles: Vec<_> = LocalPmi::group_on_hosts(&["a", "b"])
        .into_iter()
        .map(|pmi| {
            let fabric = Arc::new(Fabric::with_shm_hub(&config, Arc::clone(&hub)));
            let config = config.clone();
            std::thread::spawn(move || {
                let mut attr = TransportAttr::default();
                let pmi: Arc<dyn Pmi> = Arc::new(pmi);
                let (status, transport) = Transport::init_status(fabric, &mut attr, config, pmi);
                (status.is_success(), transport.is_none())
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), (false, true));
    }
}

#[test]
fn test_shm_only_single_host() {
    let config = SkeinConfig {
        provider: Some("shm".into()),
        ..SkeinConfig::default()
    };
    let out = run_ranks(LocalPmi::group(2), config, TransportAttr::default(), |ctx| {
        let set = ctx.transport.providers();
        (set.prov_count(), set.open_nw_provs, ctx.attr.output.mnic_count)
    });
    assert!(out.iter().all(|o| *o == (1, false, 0)));
}

#[test]
fn test_ops_after_finalize() {
    init_tracing();
    let config = SkeinConfig::default();
    let fabric = Fabric::with_defaults(&config);
    let pmi: Arc<dyn Pmi> = Arc::new(LocalPmi::group(1).remove(0));
    let mut attr = TransportAttr::default();
    let mut t = Transport::init(fabric, &mut attr, config, pmi).unwrap();
    assert!(t.finalize().is_success());
    assert!(t.is_finalized());

    let data = [1u8; 8];
    let mut req = skein::Request::new();
    // SAFETY: the call fails before touching the buffer.
    let status = unsafe { t.send(0, data.as_ptr() as u64, data.len(), 0, 1, &mut req) };
    assert!(!status.is_success());
    assert!(matches!(t.get_rank2proc_map(), Err(SkeinError::AlreadyFinalized)));
    assert!(!t.poll(0).is_success());
}
