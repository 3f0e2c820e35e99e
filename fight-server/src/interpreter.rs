//! Classifies chat messages into their effect on the boss. Pure logic, no
//! I/O, so everything interesting lives in the tests.

/// The effect a single chat message has. A message counts at most once, no
/// matter how many keywords it contains.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Effect {
    Damage,
    Heal,
    Ignore,
}

/// Applies the keyword rule: a damage keyword alone deals damage, a heal
/// keyword alone heals, a message with both kinds is ambiguous and ignored.
/// Matching is case-insensitive substring search; keyword sets arrive
/// lower-cased from the configuration.
pub fn classify(message: &str, triggers: &[String], heals: &[String]) -> Effect {
    let lowered = message.to_lowercase();
    let has_hit = triggers.iter().any(|k| lowered.contains(k.as_str()));
    let has_heal = heals.iter().any(|k| lowered.contains(k.as_str()));
    match (has_hit, has_heal) {
        (true, false) => Effect::Damage,
        (false, true) => Effect::Heal,
        _ => Effect::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keywords(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn plain_hit_deals_damage() {
        let effect = classify("HIT the boss!", &keywords(&["hit"]), &keywords(&["heal"]));
        assert_eq!(effect, Effect::Damage);
    }

    #[test]
    fn matching_is_case_insensitive_substring() {
        let effect = classify("megaHiTcombo", &keywords(&["hit"]), &keywords(&["heal"]));
        assert_eq!(effect, Effect::Damage);
    }

    #[test]
    fn heal_alone_heals() {
        let effect = classify("please HEAL him", &keywords(&["hit"]), &keywords(&["heal"]));
        assert_eq!(effect, Effect::Heal);
    }

    #[test]
    fn both_kinds_in_one_message_are_ignored() {
        let effect = classify("HIT and HEAL", &keywords(&["hit"]), &keywords(&["heal"]));
        assert_eq!(effect, Effect::Ignore);
    }

    #[test]
    fn two_damage_keywords_still_count_once() {
        let effect = classify(
            "hit hit punch",
            &keywords(&["hit", "punch"]),
            &keywords(&["heal"]),
        );
        assert_eq!(effect, Effect::Damage);
    }

    #[test]
    fn unrelated_chatter_is_ignored() {
        let effect = classify("gm everyone", &keywords(&["hit"]), &keywords(&["heal"]));
        assert_eq!(effect, Effect::Ignore);
    }

    #[test]
    fn empty_keyword_sets_match_nothing() {
        let effect = classify("hit", &[], &[]);
        assert_eq!(effect, Effect::Ignore);
    }
}
