use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use kindred_rs::compare::{ExactComparator, InitialsComparator, RESULT_EXACT, RESULT_INITIAL};
use kindred_rs::rules::{RuleDef, RuleSet, RuleTerm};
use kindred_rs::{
    AttrId, ComparatorRegistry, IdentityRepository, RefId, Reference, ResolverConfig,
};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy)]
pub struct TestSchema {
    pub name_attr: AttrId,
    pub dob_attr: AttrId,
    pub ssn_attr: AttrId,
    pub phone_attr: AttrId,
}

#[allow(dead_code)]
pub fn build_schema(repo: &mut IdentityRepository) -> TestSchema {
    TestSchema {
        name_attr: repo.interner_mut().intern_attr("name"),
        dob_attr: repo.interner_mut().intern_attr("dob"),
        ssn_attr: repo.interner_mut().intern_attr("ssn"),
        phone_attr: repo.interner_mut().intern_attr("phone"),
    }
}

#[allow(dead_code)]
pub fn default_rules(schema: &TestSchema) -> RuleSet {
    RuleSet::compile(vec![
        RuleDef::new(
            "name-dob",
            vec![
                RuleTerm::new(schema.name_attr, RESULT_EXACT),
                RuleTerm::new(schema.dob_attr, RESULT_EXACT),
            ],
        ),
        RuleDef::new(
            "name-initials-dob",
            vec![
                RuleTerm::new(schema.name_attr, RESULT_INITIAL),
                RuleTerm::new(schema.dob_attr, RESULT_EXACT),
            ],
        ),
        RuleDef::new("ssn-exact", vec![RuleTerm::new(schema.ssn_attr, RESULT_EXACT)]),
    ])
    .expect("valid rule definitions")
}

#[allow(dead_code)]
pub fn default_comparators(schema: &TestSchema) -> ComparatorRegistry {
    ComparatorRegistry::new()
        .with(schema.name_attr, Box::new(InitialsComparator))
        .with(schema.dob_attr, Box::new(ExactComparator))
        .with(schema.ssn_attr, Box::new(ExactComparator))
        .with(schema.phone_attr, Box::new(ExactComparator))
}

#[allow(dead_code)]
pub fn default_config() -> ResolverConfig {
    ResolverConfig::default()
}

#[allow(dead_code)]
pub fn person(schema: &TestSchema, source: &str, uid: &str, name: &str, dob: &str) -> Reference {
    Reference::new(RefId::new(source, uid), BTreeMap::new())
        .with_value(schema.name_attr, name)
        .with_value(schema.dob_attr, dob)
}

/// Generate a seeded dataset with controlled duplicate groups.
///
/// Roughly `duplicate_probability` of the references duplicate one of a
/// small pool of seed persons (sharing name and dob, sometimes ssn); the
/// rest are unique.
#[allow(dead_code)]
pub fn generate_dataset(
    schema: &TestSchema,
    count: u32,
    duplicate_probability: f64,
    seed: u64,
) -> Vec<Reference> {
    let mut rng = StdRng::seed_from_u64(seed);
    let sources = ["crm", "erp", "web", "mobile", "api"];
    let seed_people = [
        ("John Smith", "1980-01-01", "123-45-6789"),
        ("Jane Doe", "1975-06-15", "987-65-4321"),
        ("Alex Johnson", "1990-11-30", "555-12-3456"),
    ];

    let mut references = Vec::with_capacity(count as usize);
    for i in 0..count {
        let source = sources[rng.random_range(0..sources.len())];
        let uid = format!("{}_{:06}", source, i);
        let id = RefId::new(source, uid);

        let reference = if rng.random_bool(duplicate_probability) {
            let (name, dob, ssn) = seed_people[rng.random_range(0..seed_people.len())];
            let mut built = Reference::new(id, BTreeMap::new())
                .with_value(schema.name_attr, name)
                .with_value(schema.dob_attr, dob);
            if rng.random_bool(0.5) {
                built = built.with_value(schema.ssn_attr, ssn);
            }
            built
        } else {
            Reference::new(id, BTreeMap::new())
                .with_value(schema.name_attr, format!("Person {:06}", i))
                .with_value(schema.dob_attr, format!("19{:02}-01-01", rng.random_range(10..99)))
                .with_value(
                    schema.phone_attr,
                    format!("555-{:04}", rng.random_range(1000..9999)),
                )
        };
        references.push(reference);
    }
    references
}
