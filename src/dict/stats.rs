use std::fmt;

use super::*;

/// Chain lengths are histogrammed up to this many slots; the last slot
/// counts every chain at least that long.
pub const CHAIN_HISTOGRAM_LEN: usize = 50;

/// Structural statistics for one half of a table.
#[derive(Clone)]
pub struct TableStats {
    /// 0 for the main table, 1 for the rehashing target.
    pub table_index: usize,
    pub size: usize,
    pub used: usize,
    /// Buckets with at least one entry. Zero unless collected in full.
    pub nonempty_buckets: usize,
    pub max_chain_len: usize,
    pub total_chain_len: usize,
    /// `chain_lengths[n]` counts buckets whose chain holds `n` entries;
    /// the final slot aggregates everything at or past it.
    pub chain_lengths: [usize; CHAIN_HISTOGRAM_LEN],
}

impl TableStats {
    /// Folds another half's statistics into this one, as used when
    /// aggregating over many tables.
    pub fn merge(&mut self, other: &TableStats) {
        self.size += other.size;
        self.used += other.used;
        self.nonempty_buckets += other.nonempty_buckets;
        self.max_chain_len = self.max_chain_len.max(other.max_chain_len);
        self.total_chain_len += other.total_chain_len;
        for (into, from) in self.chain_lengths.iter_mut().zip(other.chain_lengths.iter()) {
            *into += from;
        }
    }
}

impl fmt::Display for TableStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = if self.table_index == 0 {
            "main hash table"
        } else {
            "rehashing target"
        };
        if self.used == 0 {
            return writeln!(
                f,
                "Hash table {} stats ({role}):\nNo stats available for empty tables",
                self.table_index
            );
        }
        writeln!(f, "Hash table {} stats ({role}):", self.table_index)?;
        writeln!(f, " table size: {}", self.size)?;
        writeln!(f, " number of elements: {}", self.used)?;
        if self.nonempty_buckets > 0 {
            writeln!(f, " different slots: {}", self.nonempty_buckets)?;
            writeln!(f, " max chain length: {}", self.max_chain_len)?;
            writeln!(
                f,
                " avg chain length (counted): {:.2}",
                self.total_chain_len as f64 / self.nonempty_buckets as f64
            )?;
            writeln!(
                f,
                " avg chain length (computed): {:.2}",
                self.used as f64 / self.nonempty_buckets as f64
            )?;
            writeln!(f, " Chain length distribution:")?;
            for (len, &count) in self.chain_lengths.iter().enumerate().skip(1) {
                if count == 0 {
                    continue;
                }
                let suffix = if len == CHAIN_HISTOGRAM_LEN - 1 { "+" } else { "" };
                writeln!(
                    f,
                    "   {len}{suffix}: {count} ({:.2}%)",
                    count as f64 / self.size as f64 * 100.0
                )?;
            }
        }
        Ok(())
    }
}

/// Statistics for a whole table, as returned by [`Dict::stats`].
#[derive(Clone)]
pub struct DictStats {
    pub main: TableStats,
    /// Present while a rehash is in progress.
    pub rehashing: Option<TableStats>,
}

impl fmt::Display for DictStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.main.fmt(f)?;
        if let Some(rehashing) = &self.rehashing {
            rehashing.fmt(f)?;
        }
        Ok(())
    }
}

impl<T: DictType> Dict<T> {
    fn table_stats(&self, table: usize, full: bool) -> TableStats {
        let mut stats = TableStats {
            table_index: table,
            size: self.table_size(table),
            used: self.used[table],
            nonempty_buckets: 0,
            max_chain_len: 0,
            total_chain_len: 0,
            chain_lengths: [0; CHAIN_HISTOGRAM_LEN],
        };
        if !full {
            return stats;
        }
        for idx in 0..self.table_size(table) {
            let mut he = self.bucket_at(table, idx);
            if he.is_null() {
                stats.chain_lengths[0] += 1;
                continue;
            }
            stats.nonempty_buckets += 1;
            let mut chain_len = 0;
            while !he.is_null() {
                chain_len += 1;
                he = he.next();
            }
            stats.chain_lengths[chain_len.min(CHAIN_HISTOGRAM_LEN - 1)] += 1;
            stats.max_chain_len = stats.max_chain_len.max(chain_len);
            stats.total_chain_len += chain_len;
        }
        stats
    }

    /// Structural statistics for both halves. `full` walks every chain to
    /// histogram their lengths; otherwise only sizes and element counts are
    /// reported.
    pub fn stats(&self, full: bool) -> DictStats {
        DictStats {
            main: self.table_stats(0, full),
            rehashing: if self.is_rehashing() {
                Some(self.table_stats(1, full))
            } else {
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::without_provenance_mut;

    struct AddrKeys;

    unsafe impl DictType for AddrKeys {
        fn hash(key: *const u8) -> u64 {
            gen_hash(&(key.addr() as u64).to_le_bytes())
        }
    }

    fn key(n: u64) -> *mut u8 {
        without_provenance_mut(n as usize)
    }

    #[test]
    fn histogram_accounts_for_every_bucket() {
        let _shared = crate::dict::TEST_POLICY_GUARD.read().expect("policy guard");
        let mut d = Dict::<AddrKeys>::new();
        for n in 1..=300 {
            d.add(key(n), key(n));
        }
        while d.rehash(100) {}
        let stats = d.stats(true);
        assert!(stats.rehashing.is_none());

        let main = &stats.main;
        assert_eq!(main.used, 300);
        assert_eq!(main.chain_lengths.iter().sum::<usize>(), main.size);
        assert_eq!(main.total_chain_len, 300);
        assert!(main.max_chain_len >= 1);
        let counted: usize = main
            .chain_lengths
            .iter()
            .enumerate()
            .map(|(len, &count)| len * count)
            .sum();
        assert_eq!(counted, 300, "histogram must cover every entry");
    }

    #[test]
    fn rehashing_half_is_reported() {
        let _shared = crate::dict::TEST_POLICY_GUARD.read().expect("policy guard");
        let mut d = Dict::<AddrKeys>::new();
        for n in 1..=128 {
            d.add(key(n), key(n));
        }
        while d.rehash(100) {}
        d.expand(1024);
        assert!(d.is_rehashing());
        let stats = d.stats(true);
        let target = stats.rehashing.expect("rehashing half present");
        assert_eq!(target.size, 1024);
        assert_eq!(stats.main.used + target.used, 128);
    }

    #[test]
    fn shallow_stats_skip_the_walk() {
        let mut d = Dict::<AddrKeys>::new();
        for n in 1..=64 {
            d.add(key(n), key(n));
        }
        let stats = d.stats(false);
        assert_eq!(stats.main.used, 64);
        assert_eq!(stats.main.nonempty_buckets, 0);
    }

    #[test]
    fn merge_sums_halves() {
        let mut d = Dict::<AddrKeys>::new();
        for n in 1..=256 {
            d.add(key(n), key(n));
        }
        d.expand(2048);
        d.rehash(3);
        let stats = d.stats(true);
        let mut combined = stats.main.clone();
        combined.merge(stats.rehashing.as_ref().expect("rehashing half"));
        assert_eq!(combined.used, 256);
        assert_eq!(combined.size, stats.main.size + stats.rehashing.as_ref().map_or(0, |s| s.size));
    }

    #[test]
    fn report_renders_for_empty_and_full_tables() {
        let d = Dict::<AddrKeys>::new();
        let text = d.stats(true).to_string();
        assert!(text.contains("No stats available"));

        let mut d = Dict::<AddrKeys>::new();
        for n in 1..=100 {
            d.add(key(n), key(n));
        }
        let text = d.stats(true).to_string();
        assert!(text.contains("main hash table"));
        assert!(text.contains("number of elements: 100"));
        assert!(text.contains("Chain length distribution"));
    }
}
