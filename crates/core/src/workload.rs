//! Workload generation: arrival processes, token-length sampling,
//! multi-client merging and shared-prefix structure.
//!
//! Every client draws from its own named RNG streams, so adding a client or
//! reordering the spec never perturbs the others' samples, and request ids
//! are assigned in merged arrival order.

use crate::kv::input_block_hashes;
use crate::request::Request;
use crate::rng::PartitionedRng;
use blis_config::{ArrivalSpec, ClientSpec, LengthSpec, WorkloadSpec};
use blis_types::{RequestId, Ticks, TICKS_PER_SEC};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Exp, Gamma, LogNormal, Normal, Weibull};

/// Inter-arrival gap in seconds.
fn sample_gap(spec: &ArrivalSpec, rng: &mut StdRng) -> f64 {
    let gap = match spec {
        ArrivalSpec::FixedRate { rate } => 1.0 / rate,
        ArrivalSpec::Poisson { rate } => {
            Exp::new(*rate).expect("validated rate > 0").sample(rng)
        }
        ArrivalSpec::Gamma { shape, rate } => Gamma::new(*shape, 1.0 / rate)
            .expect("validated shape, rate > 0")
            .sample(rng),
        ArrivalSpec::Weibull { shape, scale } => Weibull::new(*scale, *shape)
            .expect("validated shape, scale > 0")
            .sample(rng),
    };
    gap.max(0.0)
}

/// Token count, clamped to at least one.
fn sample_len(spec: &LengthSpec, rng: &mut StdRng) -> usize {
    let sampled = match spec {
        LengthSpec::Fixed { value } => *value as f64,
        LengthSpec::Uniform { min, max } => rng.gen_range(*min..=*max) as f64,
        LengthSpec::Normal { mean, std_dev } => Normal::new(*mean, *std_dev)
            .expect("validated parameters")
            .sample(rng),
        LengthSpec::LogNormal { mu, sigma } => LogNormal::new(*mu, *sigma)
            .expect("validated parameters")
            .sample(rng),
    };
    (sampled.round() as i64).max(1) as usize
}

/// Stable synthetic token value; identical inputs produce identical tokens
/// across runs and platforms.
fn synth_token(salt: u64, stream: u64, position: u64) -> u64 {
    let mut x = salt
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(stream)
        .wrapping_mul(0xbf58_476d_1ce4_e5b9)
        .wrapping_add(position);
    x ^= x >> 31;
    x.wrapping_mul(0x94d0_49bb_1331_11eb)
}

const SHARED_PREFIX_SALT: u64 = 0x5eed_0001;
const UNIQUE_BODY_SALT: u64 = 0x5eed_0002;

struct Draft {
    arrival: Ticks,
    client_index: usize,
    sequence: usize,
    input_tokens: usize,
    output_tokens: usize,
    tokens: Vec<u64>,
    tenant: Option<String>,
    slo_class: blis_types::SloClass,
}

fn generate_client(
    client_index: usize,
    client: &ClientSpec,
    rng: &mut PartitionedRng,
) -> Vec<Draft> {
    let arrival_stream = format!("arrivals/{}", client.name);
    let input_stream = format!("input-lens/{}", client.name);
    let output_stream = format!("output-lens/{}", client.name);
    let group_stream = format!("prefix-groups/{}", client.name);

    let mut drafts = Vec::with_capacity(client.num_requests);
    let mut elapsed_secs = 0.0;
    for sequence in 0..client.num_requests {
        elapsed_secs += sample_gap(&client.arrival, rng.stream(&arrival_stream));
        let arrival = (elapsed_secs * TICKS_PER_SEC as f64).round() as Ticks;
        let input_tokens = sample_len(&client.input_len, rng.stream(&input_stream));
        let output_tokens = sample_len(&client.output_len, rng.stream(&output_stream));

        let (group, prefix_tokens) = match &client.prefix {
            Some(prefix) if prefix.groups > 0 => (
                rng.stream(&group_stream).gen_range(0..prefix.groups) as u64,
                prefix.prefix_tokens.min(input_tokens),
            ),
            _ => (0, 0),
        };

        // The simulator never tokenizes anything; these synthetic values
        // exist purely to drive the chained block hashes, with the shared
        // prefix identical across a group and the body unique per request.
        let client_tag = client_index as u64;
        let tokens: Vec<u64> = (0..input_tokens as u64)
            .map(|position| {
                if position < prefix_tokens as u64 {
                    synth_token(SHARED_PREFIX_SALT, client_tag << 32 | group, position)
                } else {
                    synth_token(
                        UNIQUE_BODY_SALT,
                        client_tag << 32 | sequence as u64,
                        position,
                    )
                }
            })
            .collect();

        drafts.push(Draft {
            arrival,
            client_index,
            sequence,
            input_tokens,
            output_tokens,
            tokens,
            tenant: client.tenant.clone().or_else(|| Some(client.name.clone())),
            slo_class: client.slo_class,
        });
    }
    drafts
}

/// Generate the full request stream for a run, sorted by arrival with
/// stable ids in arrival order.
pub fn generate(spec: &WorkloadSpec, block_size: usize, rng: &mut PartitionedRng) -> Vec<Request> {
    let mut drafts: Vec<Draft> = spec
        .clients()
        .iter()
        .enumerate()
        .flat_map(|(index, client)| generate_client(index, client, rng))
        .collect();
    // Same-tick ties resolve by spec order, keeping the merge stable.
    drafts.sort_by_key(|draft| (draft.arrival, draft.client_index, draft.sequence));

    drafts
        .into_iter()
        .enumerate()
        .map(|(index, draft)| {
            let mut request = Request::new(
                RequestId(index as u64),
                draft.arrival,
                draft.input_tokens,
                draft.output_tokens,
                input_block_hashes(&draft.tokens, block_size),
            );
            request.tenant = draft.tenant;
            request.slo_class = draft.slo_class;
            request
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use blis_config::PrefixSpec;
    use blis_types::SloClass;

    fn client(name: &str, arrival: ArrivalSpec, num_requests: usize) -> ClientSpec {
        ClientSpec {
            name: name.to_string(),
            tenant: None,
            slo_class: SloClass::Standard,
            arrival,
            input_len: LengthSpec::Fixed { value: 128 },
            output_len: LengthSpec::Fixed { value: 32 },
            num_requests,
            prefix: None,
        }
    }

    #[test]
    fn same_seed_same_workload() {
        let spec = WorkloadSpec::Single(client(
            "chat",
            ArrivalSpec::Poisson { rate: 50.0 },
            64,
        ));
        let a = generate(&spec, 16, &mut PartitionedRng::new(42));
        let b = generate(&spec, 16, &mut PartitionedRng::new(42));
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.arrival, y.arrival);
            assert_eq!(x.input_tokens, y.input_tokens);
            assert_eq!(x.block_hashes, y.block_hashes);
        }
    }

    #[test]
    fn fixed_rate_spaces_arrivals_evenly() {
        let spec = WorkloadSpec::Single(client(
            "steady",
            ArrivalSpec::FixedRate { rate: 100.0 },
            5,
        ));
        let requests = generate(&spec, 16, &mut PartitionedRng::new(1));
        let arrivals: Vec<Ticks> = requests.iter().map(|r| r.arrival).collect();
        assert_eq!(arrivals, vec![10_000, 20_000, 30_000, 40_000, 50_000]);
    }

    #[test]
    fn ids_follow_merged_arrival_order() {
        let spec = WorkloadSpec::MultiClient {
            clients: vec![
                client("slow", ArrivalSpec::FixedRate { rate: 10.0 }, 3),
                client("fast", ArrivalSpec::FixedRate { rate: 100.0 }, 3),
            ],
        };
        let requests = generate(&spec, 16, &mut PartitionedRng::new(7));
        let mut sorted = requests.clone();
        sorted.sort_by_key(|r| r.arrival);
        for (index, request) in sorted.iter().enumerate() {
            assert_eq!(request.id, RequestId(index as u64));
        }
        // Tenants default to the client name.
        assert!(requests.iter().any(|r| r.tenant.as_deref() == Some("fast")));
    }

    #[test]
    fn prefix_groups_share_block_hashes() {
        let mut spec_client = client("grouped", ArrivalSpec::FixedRate { rate: 50.0 }, 40);
        spec_client.prefix = Some(PrefixSpec {
            groups: 2,
            prefix_tokens: 64,
        });
        let requests = generate(
            &WorkloadSpec::Single(spec_client),
            16,
            &mut PartitionedRng::new(3),
        );

        // 64 prefix tokens = 4 shared blocks. With only two groups there
        // must be hash collisions across requests, and any two requests
        // either share all four prefix blocks or none.
        let mut matched = 0;
        for pair in requests.windows(2) {
            let shared = pair[0]
                .block_hashes
                .iter()
                .zip(&pair[1].block_hashes)
                .take_while(|(a, b)| a == b)
                .count();
            assert!(shared == 0 || shared == 4, "partial prefix match: {shared}");
            if shared == 4 {
                matched += 1;
            }
        }
        assert!(matched > 0, "no shared prefixes in 40 grouped requests");
        // Bodies stay unique: full hash lists never fully collide.
        for pair in requests.windows(2) {
            assert_ne!(pair[0].block_hashes, pair[1].block_hashes);
        }
    }

    #[test]
    fn normal_lengths_clamp_to_one() {
        let mut spec_client = client("tiny", ArrivalSpec::FixedRate { rate: 10.0 }, 32);
        spec_client.input_len = LengthSpec::Normal {
            mean: 1.0,
            std_dev: 50.0,
        };
        let requests = generate(
            &WorkloadSpec::Single(spec_client),
            16,
            &mut PartitionedRng::new(9),
        );
        assert!(requests.iter().all(|r| r.input_tokens >= 1));
    }
}
