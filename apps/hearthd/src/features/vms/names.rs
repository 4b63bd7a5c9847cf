use chrono::Utc;
use rand::seq::SliceRandom;

const MAX_ATTEMPTS: usize = 100;

const ADVERBS: &[&str] = &[
    "boldly", "briskly", "calmly", "cheerfully", "cleverly", "daily", "deftly", "eagerly",
    "early", "fiercely", "fondly", "gently", "gladly", "greatly", "happily", "keenly",
    "kindly", "lightly", "loudly", "merrily", "neatly", "nicely", "oddly", "proudly",
    "quickly", "quietly", "rapidly", "slowly", "softly", "warmly",
];

const ADJECTIVES: &[&str] = &[
    "amber", "ancient", "autumn", "billowing", "bitter", "bold", "brave", "bright",
    "broad", "calm", "cool", "crimson", "curly", "damp", "dawn", "delicate",
    "divine", "dry", "empty", "falling", "fancy", "flat", "floral", "fragrant",
    "frosty", "gentle", "green", "hidden", "holy", "icy", "jolly", "late",
    "lingering", "little", "lively", "long", "lucky", "misty", "morning", "muddy",
    "nameless", "noisy", "odd", "old", "patient", "plain", "polished", "proud",
    "purple", "quiet", "rapid", "raspy", "restless", "rough", "round", "royal",
    "shiny", "shy", "silent", "small", "snowy", "solitary", "sparkling", "spring",
    "square", "steep", "still", "summer", "sweet", "tight", "tiny", "twilight",
    "wandering", "weathered", "white", "wild", "winter", "wispy", "withered", "young",
];

const NOUNS: &[&str] = &[
    "badger", "bastion", "beacon", "bird", "breeze", "brook", "bush", "butterfly",
    "cell", "cherry", "cliff", "cloud", "comet", "darkness", "dawn", "dew",
    "disk", "dream", "dust", "feather", "field", "finch", "fire", "firefly",
    "flower", "fog", "forest", "frog", "frost", "glade", "glitter", "grass",
    "harbor", "haze", "heron", "hill", "lake", "leaf", "lantern", "meadow",
    "moon", "morning", "mountain", "night", "otter", "paper", "pine", "pond",
    "rain", "resonance", "river", "sea", "shadow", "shape", "silence", "sky",
    "smoke", "snow", "snowflake", "sound", "star", "stream", "sun", "sunset",
    "surf", "thunder", "tree", "violet", "voice", "water", "waterfall", "wave",
    "wildflower", "wind", "wood",
];

/// Draw an adverb-adjective-noun name not currently in use. After 100
/// rejected draws a 4-digit time suffix breaks the tie.
pub fn generate(is_taken: impl Fn(&str) -> bool) -> String {
    let mut rng = rand::thread_rng();
    let mut last = draw(&mut rng);
    for _ in 0..MAX_ATTEMPTS {
        if !is_taken(&last) {
            return last;
        }
        last = draw(&mut rng);
    }
    format!("{last}-{:04}", Utc::now().timestamp() % 10000)
}

fn draw(rng: &mut impl rand::Rng) -> String {
    format!(
        "{}-{}-{}",
        ADVERBS.choose(rng).unwrap(),
        ADJECTIVES.choose(rng).unwrap(),
        NOUNS.choose(rng).unwrap(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn names_have_three_hyphenated_words() {
        let name = generate(|_| false);
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts.len(), 3, "unexpected name: {name}");
        assert!(ADVERBS.contains(&parts[0]));
        assert!(ADJECTIVES.contains(&parts[1]));
        assert!(NOUNS.contains(&parts[2]));
    }

    #[test]
    fn collisions_are_rejected() {
        let taken: HashSet<String> = (0..64).map(|_| generate(|_| false)).collect();
        let name = generate(|candidate| taken.contains(candidate));
        assert!(!taken.contains(&name));
    }

    #[test]
    fn everything_taken_falls_back_to_numeric_suffix() {
        let name = generate(|_| true);
        let suffix = name.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }
}
