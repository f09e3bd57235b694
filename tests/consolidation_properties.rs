mod support;

use chrono::{TimeZone, Utc};
use kindred_rs::{
    IdentityId, IdentityRepository, RefId, Resolver, ResolverConfig, Strategy, VecSource,
};
use std::collections::BTreeSet;
use support::{build_schema, default_comparators, default_rules, generate_dataset, person};

fn resolver_with_strategy(strategy: Strategy) -> (Resolver, support::TestSchema) {
    let mut repo = IdentityRepository::new();
    let schema = build_schema(&mut repo);
    let rules = default_rules(&schema);
    let comparators = default_comparators(&schema);
    let config = ResolverConfig {
        strategy,
        ..ResolverConfig::default()
    };
    (Resolver::new(repo, rules, comparators, config), schema)
}

#[test]
fn reintegration_is_idempotent() -> anyhow::Result<()> {
    let (mut resolver, schema) = resolver_with_strategy(Strategy::FirstMatch);

    let r = person(&schema, "crm", "1", "John Smith", "1980-01-01");
    let first = resolver.integrate(r.clone())?;
    let again = resolver.integrate(r)?;

    assert_eq!(first.identity(), again.identity());
    assert_eq!(resolver.repository().len(), 1);
    assert_eq!(resolver.repository().reference_count(), 1);

    Ok(())
}

#[test]
fn singular_ownership_over_generated_dataset() -> anyhow::Result<()> {
    let (mut resolver, schema) = resolver_with_strategy(Strategy::FullConsolidation);
    let references = generate_dataset(&schema, 300, 0.3, 11);
    let total = references.len();

    let mut source = VecSource::new(references);
    let report = resolver.resolve(&mut source)?;
    assert_eq!(report.assignments.len(), total);

    // Every reference id belongs to exactly one live cluster, and the link
    // map agrees with cluster membership.
    let repo = resolver.repository();
    let mut seen: BTreeSet<RefId> = BTreeSet::new();
    let mut member_total = 0usize;
    for cluster in repo.identities() {
        for member in cluster.members() {
            assert!(seen.insert(member.id.clone()), "{} owned twice", member.id);
            assert_eq!(repo.identity_of(&member.id), Some(&cluster.identity));
            member_total += 1;
        }
    }
    assert_eq!(member_total, total);
    assert_eq!(repo.reference_count(), total);

    Ok(())
}

/// Build three pre-existing clusters with fixed creation dates that all
/// match each other through shared name/dob values.
fn seed_three_clusters(
    resolver: &mut Resolver,
    schema: &support::TestSchema,
    order: [usize; 3],
) -> anyhow::Result<Vec<IdentityId>> {
    let seeds = [
        ("a", "John Smith|Jon Smith", "1980-01-01"),
        ("b", "John Smith|Jack Smith", "1980-01-01"),
        ("c", "John Smith|Jim Smith", "1980-01-01"),
    ];
    let mut ids = vec![None, None, None];
    for &slot in &order {
        let (uid, name, dob) = seeds[slot];
        let reference = person(schema, "crm", uid, name, dob);
        let repo = resolver.repository_mut();
        let identity = repo.create_identity(reference, Default::default(), "run-0")?;
        // Pin the creation date so precedence is independent of wall clock.
        let mut cluster = repo.detach(&identity).unwrap();
        cluster.created = Utc.timestamp_opt(1_000 + slot as i64, 0).unwrap();
        repo.insert_cluster(cluster)?;
        ids[slot] = Some(identity);
    }
    Ok(ids.into_iter().map(Option::unwrap).collect())
}

#[test]
fn consolidation_outcome_is_order_independent() -> anyhow::Result<()> {
    let mut outcomes = Vec::new();

    for order in [[0usize, 1, 2], [2, 0, 1], [1, 2, 0]] {
        let (mut resolver, schema) = resolver_with_strategy(Strategy::IterativeFixpoint);
        let ids = seed_three_clusters(&mut resolver, &schema, order)?;

        let report = resolver.consolidate()?;
        assert_eq!(report.survivors, 1);
        assert_eq!(report.merges, 2);

        let survivor = resolver.repository().live_identities();
        assert_eq!(survivor.len(), 1);
        // The fixed earliest-created cluster wins regardless of merge order.
        assert_eq!(survivor[0], ids[0]);

        let members: BTreeSet<RefId> = resolver
            .repository()
            .identity(&survivor[0])
            .unwrap()
            .member_ids()
            .into_iter()
            .collect();
        outcomes.push(members);
    }

    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[1], outcomes[2]);

    Ok(())
}

#[test]
fn full_consolidation_winner_is_order_independent() -> anyhow::Result<()> {
    let mut winners = Vec::new();

    for order in [[0usize, 1, 2], [2, 1, 0]] {
        let (mut resolver, schema) = resolver_with_strategy(Strategy::FullConsolidation);
        let ids = seed_three_clusters(&mut resolver, &schema, order)?;

        // An input matching all three collapses them into the tie-break
        // minimum in one consolidation step.
        let input = person(&schema, "web", "in", "John Smith", "1980-01-01");
        let outcome = resolver.integrate(input)?;

        let identity = outcome.identity().unwrap().clone();
        assert_eq!(identity, ids[0]);
        assert_eq!(resolver.repository().len(), 1);
        winners.push(identity);
    }

    assert_eq!(winners[0], winners[1]);
    Ok(())
}

#[test]
fn merge_ledger_preserves_absorbed_history() -> anyhow::Result<()> {
    let (mut resolver, schema) = resolver_with_strategy(Strategy::FullConsolidation);
    let ids = seed_three_clusters(&mut resolver, &schema, [0, 1, 2])?;

    let input = person(&schema, "web", "in", "John Smith", "1980-01-01");
    resolver.integrate(input)?;

    let survivor = resolver.repository().identity(&ids[0]).unwrap();
    for absorbed in &ids[1..] {
        assert!(
            survivor.ledger().contains_key(absorbed),
            "missing ledger entry for {absorbed}"
        );
    }
    Ok(())
}
