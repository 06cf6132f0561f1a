//! Enumeration of selection value combinations.

/// Weight of each selection in the flat variant index.
///
/// The first selection varies fastest: `weight_0 = 1` and `weight_i = Π_{j<i} count_j`.
pub fn weights(counts: &[usize]) -> Vec<usize> {
    let mut weight = 1;

    counts
        .iter()
        .map(|count| {
            let res = weight;
            weight *= count;

            res
        })
        .collect()
}

/// The number of variants; `1` when no selection is used.
pub fn variant_count(counts: &[usize]) -> usize {
    counts.iter().product()
}

/// The flat variant index of `values`.
pub fn variant_index(values: &[usize], weights: &[usize]) -> usize {
    values
        .iter()
        .zip(weights)
        .map(|(value, weight)| value * weight)
        .sum()
}

/// Every combination of selection values, in flat index order.
///
/// An odometer over `counts`: the first digit turns fastest.
#[derive(Clone, Debug)]
pub struct Variants {
    counts: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl Variants {
    pub fn new(counts: &[usize]) -> Self {
        let next = (!counts.contains(&0)).then(|| vec![0; counts.len()]);

        Self {
            counts: counts.to_vec(),
            next,
        }
    }
}

impl Iterator for Variants {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let res = self.next.take()?;
        let mut next = res.clone();

        for (digit, count) in next.iter_mut().zip(&self.counts) {
            *digit += 1;

            if *digit < *count {
                self.next = Some(next);

                break;
            }

            *digit = 0;
        }

        Some(res)
    }
}
