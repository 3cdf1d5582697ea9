//! ADD / DEL / CHECK command flows

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, warn};

use warren_etcd::Client;
use warren_ipam::{
    load_ipam_config, IpAllocator, IpConfig, IpamConfig, IpamError, LeaseManager, Range, RangeSet,
    SimpleRange, Store,
};

use crate::cni::CmdArgs;
use crate::resolv::parse_resolv_conf;
use crate::result::{CniResult, Dns, IpResult};

/// Allocation attempts per range before the whole ADD fails; each failed
/// attempt acquires a fresh lease block first
const MAX_ALLOC_TRY: usize = 3;

const SUPPORTED_VERSIONS: &[&str] = &["0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0"];

/// Coordinator connection, established lazily on the first lease miss
struct Coordinator {
    client: Client,
    manager: LeaseManager,
}

async fn coordinator(slot: &mut Option<Coordinator>) -> Result<&mut Coordinator> {
    if slot.is_none() {
        let client = Client::connect().await.context("connecting to coordinator")?;
        let manager = LeaseManager::new(client.root_key(), client.node_id());
        *slot = Some(Coordinator { client, manager });
    }
    slot.as_mut()
        .ok_or_else(|| anyhow!("coordinator connection missing"))
}

pub async fn cmd_add(args: &CmdArgs) -> Result<()> {
    let (conf, cni_version) = load_ipam_config(&args.stdin_data, args.args.as_deref())?;
    debug!(
        network = %conf.name,
        container = %args.container_id,
        ifname = %args.if_name,
        "handling ADD"
    );

    let dns = match &conf.resolv_conf {
        Some(path) => parse_resolv_conf(path)?,
        None => Dns::default(),
    };

    let mut store = Store::open(&conf.name, &conf.data_dir)?;
    let ips = allocate_ips(&conf, &mut store, &args.container_id, &args.if_name).await?;

    print_result(&CniResult {
        cni_version,
        ips,
        routes: conf.routes.clone(),
        dns,
    })
}

pub async fn cmd_del(args: &CmdArgs) -> Result<()> {
    let (conf, _) = load_ipam_config(&args.stdin_data, args.args.as_deref())?;
    debug!(
        network = %conf.name,
        container = %args.container_id,
        "handling DEL"
    );

    let mut store = Store::open(&conf.name, &conf.data_dir)?;

    // release every range, even when one fails
    let mut errors = Vec::new();
    for (idx, set) in conf.ranges.iter().enumerate() {
        let alloc = IpAllocator::new(set.clone(), idx);
        if let Err(e) = alloc.release(&mut store, &args.container_id, &args.if_name) {
            errors.push(e.to_string());
        }
    }
    if !errors.is_empty() {
        bail!("{}", errors.join(";"));
    }
    Ok(())
}

pub async fn cmd_check(args: &CmdArgs) -> Result<()> {
    let (conf, _) = load_ipam_config(&args.stdin_data, args.args.as_deref())?;

    let mut store = Store::open(&conf.name, &conf.data_dir)?;
    store.lock()?;
    let found = store.has_by_id(&args.container_id, &args.if_name);
    store.unlock()?;

    if !found? {
        bail!(
            "failed to find address added by container {}",
            args.container_id
        );
    }
    Ok(())
}

pub fn cmd_version() -> Result<()> {
    let body = serde_json::json!({
        "cniVersion": "0.4.0",
        "supportedVersions": SUPPORTED_VERSIONS,
    });
    println!("{}", body);
    Ok(())
}

fn print_result(result: &CniResult) -> Result<()> {
    println!("{}", serde_json::to_string(result)?);
    Ok(())
}

/// The ranges each configured set may allocate from right now: the
/// configured ranges clipped to the lease blocks this node holds
///
/// A set with no overlap comes back empty; the allocation loop acquires a
/// fresh lease for it on demand.
fn form_range_sets(origin: &[RangeSet], cache: &[SimpleRange]) -> Vec<Vec<Range>> {
    origin
        .iter()
        .map(|set| {
            let mut clipped = Vec::new();
            for range in set.iter() {
                for block in cache {
                    if let Some(r) = range.clip(block) {
                        clipped.push(r);
                    }
                }
            }
            clipped
        })
        .collect()
}

/// Allocate one address per configured range set
///
/// Failure for any set releases everything reserved so far before
/// returning; secondary rollback errors only get logged, the reconciler
/// cleans up behind them.
async fn allocate_ips(
    conf: &IpamConfig,
    store: &mut Store,
    container_id: &str,
    if_name: &str,
) -> Result<Vec<IpResult>> {
    store.lock()?;
    let cache = store.load_cache();
    store.unlock()?;
    let sets = form_range_sets(&conf.ranges, &cache?);

    if let Some(ip) = conf.requested_ip {
        if !conf.ranges.iter().any(|set| set.contains(ip)) {
            return Err(IpamError::IpNotInRange(ip).into());
        }
    }

    let mut slot: Option<Coordinator> = None;
    let mut assigned = Vec::with_capacity(sets.len());

    for (idx, ranges) in sets.into_iter().enumerate() {
        let requested = conf
            .requested_ip
            .filter(|ip| conf.ranges[idx].contains(*ip));
        let result = allocate_one(
            conf,
            store,
            idx,
            ranges,
            requested,
            container_id,
            if_name,
            &mut slot,
        )
        .await;
        match result {
            Ok(ip_conf) => {
                info!(address = %ip_conf.address, range = idx, "assigned address");
                assigned.push(IpResult::from(ip_conf));
            }
            Err(e) => {
                if let Err(rollback) = store.release_by_id(container_id, if_name) {
                    warn!(error = %rollback, "rolling back partial allocation failed");
                }
                return Err(e).with_context(|| format!("failed to allocate for range {}", idx));
            }
        }
    }
    Ok(assigned)
}

#[allow(clippy::too_many_arguments)]
async fn allocate_one(
    conf: &IpamConfig,
    store: &mut Store,
    idx: usize,
    ranges: Vec<Range>,
    requested: Option<std::net::Ipv4Addr>,
    container_id: &str,
    if_name: &str,
    slot: &mut Option<Coordinator>,
) -> Result<IpConfig> {
    let mut outcome = if ranges.is_empty() {
        Err(IpamError::NoAddressesAvailable)
    } else {
        IpAllocator::new(RangeSet::new(ranges)?, idx).get(store, container_id, if_name, requested)
    };

    let mut attempt = 0;
    loop {
        match outcome {
            Ok(ip_conf) => return Ok(ip_conf),
            Err(IpamError::NoAddressesAvailable) if attempt < MAX_ALLOC_TRY => {
                attempt += 1;
                let template = conf.ranges[idx]
                    .get(0)
                    .ok_or_else(|| anyhow!("range set {} is empty", idx))?
                    .clone();

                let coord = coordinator(slot).await?;
                let block = coord
                    .manager
                    .acquire(
                        &mut coord.client,
                        &conf.name,
                        template.subnet,
                        conf.apply_unit,
                    )
                    .await?;
                debug!(%block, attempt, range = idx, "acquired lease block after exhaustion");

                store.lock()?;
                let cached = store.append_cache(&block);
                store.unlock()?;
                if let Err(e) = cached {
                    // the block stays claimed; the reconciler restores parity
                    warn!(%block, error = %e, "caching acquired block failed");
                }

                let fresh = template.with_block(&block);
                outcome =
                    IpAllocator::new(RangeSet::new(vec![fresh])?, idx).get(store, container_id, if_name, None);
            }
            Err(e) => return Err(e.into()),
        }
    }
}
