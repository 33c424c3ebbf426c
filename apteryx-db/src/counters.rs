//! Process-wide operation tallies, exposed under `/apteryx/counters/`.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        #[derive(Default)]
        pub struct Counters {
            $(pub $name: AtomicU64,)*
        }

        impl Counters {
            pub const NAMES: &'static [&'static str] = &[$(stringify!($name),)*];

            /// Current value of a counter by name.
            pub fn value(&self, name: &str) -> Option<u64> {
                match name {
                    $(stringify!($name) => Some(self.$name.load(Ordering::Relaxed)),)*
                    _ => None,
                }
            }
        }
    };
}

counters! {
    set,
    set_invalid,
    get,
    get_invalid,
    search,
    search_invalid,
    traverse,
    query,
    find,
    prune,
    timestamp,
    memuse,
    watched,
    validated,
    refreshed,
    provided,
    indexed,
    proxied,
}

impl Counters {
    pub fn new() -> Self {
        Counters::default()
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
