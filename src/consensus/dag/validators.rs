use std::{
    collections::HashMap,
    fmt::{self, Debug, Display, Formatter},
    iter::FromIterator,
    ops::{Index, IndexMut},
};

use datasize::DataSize;
use serde::{Deserialize, Serialize};

use super::weight::Weight;
use crate::consensus::traits::ValidatorIdT;

/// The index of a validator, in a list of all validators, ordered by ID.
#[derive(
    Copy, Clone, DataSize, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct ValidatorIndex(pub u32);

impl Display for ValidatorIndex {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u32> for ValidatorIndex {
    fn from(idx: u32) -> Self {
        ValidatorIndex(idx)
    }
}

/// Information about a validator: their ID and weight.
#[derive(Clone, DataSize, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Validator<VID> {
    id: VID,
    weight: Weight,
}

impl<VID> Validator<VID> {
    /// Returns the validator's ID.
    pub fn id(&self) -> &VID {
        &self.id
    }

    /// Returns the validator's voting weight.
    pub fn weight(&self) -> Weight {
        self.weight
    }
}

impl<VID, W: Into<Weight>> From<(VID, W)> for Validator<VID> {
    fn from((id, weight): (VID, W)) -> Validator<VID> {
        Validator {
            id,
            weight: weight.into(),
        }
    }
}

/// The validator set, i.e. the list of all validators' IDs and weights, ordered by ID.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Validators<VID: Eq + std::hash::Hash> {
    index_by_id: HashMap<VID, ValidatorIndex>,
    validators: Vec<Validator<VID>>,
}

impl<VID: ValidatorIdT> Validators<VID> {
    /// Returns the number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Returns `true` if there are no validators.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Returns the sum of all validators' weights.
    pub fn total_weight(&self) -> Weight {
        self.validators
            .iter()
            .map(|validator| validator.weight())
            .sum()
    }

    /// Returns the index of the validator with the given ID, if present.
    pub fn get_index(&self, id: &VID) -> Option<ValidatorIndex> {
        self.index_by_id.get(id).cloned()
    }

    /// Returns the validator at the given index. Panics if the index is out of range.
    pub fn get_by_index(&self, idx: ValidatorIndex) -> &Validator<VID> {
        &self.validators[idx.0 as usize]
    }

    /// Returns the ID of the validator at the given index, if the index is in range.
    pub fn id(&self, idx: ValidatorIndex) -> Option<&VID> {
        self.validators.get(idx.0 as usize).map(Validator::id)
    }

    /// Returns whether the given ID belongs to a validator in this set.
    pub fn contains(&self, id: &VID) -> bool {
        self.index_by_id.contains_key(id)
    }

    /// Returns an iterator over all validators, in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Validator<VID>> {
        self.validators.iter()
    }

    /// Returns an iterator over all validator indexes.
    pub fn iter_indexes(&self) -> impl Iterator<Item = ValidatorIndex> {
        (0..self.validators.len() as u32).map(ValidatorIndex)
    }

    /// Returns the map of cumulative weights: entry `i` contains the sum of the weights of
    /// validators `0` through `i`. Used for weighted leader selection.
    pub fn cumulative_weights(&self) -> ValidatorMap<Weight> {
        let mut sum = Weight(0);
        self.validators
            .iter()
            .map(|validator| {
                sum = sum
                    .checked_add(validator.weight())
                    .expect("total weight must be < 2^64");
                sum
            })
            .collect()
    }
}

impl<VID: ValidatorIdT, W: Into<Weight>> FromIterator<(VID, W)> for Validators<VID> {
    fn from_iter<I: IntoIterator<Item = (VID, W)>>(ii: I) -> Validators<VID> {
        let mut validators: Vec<Validator<VID>> = ii.into_iter().map(Validator::from).collect();
        // A fixed order gives all nodes identical indexes for identical bonds.
        validators.sort_by(|val0, val1| val0.id().cmp(val1.id()));
        let index_by_id = validators
            .iter()
            .enumerate()
            .map(|(idx, validator)| (validator.id().clone(), ValidatorIndex(idx as u32)))
            .collect();
        Validators {
            index_by_id,
            validators,
        }
    }
}

/// A vector indexed by validator index, holding one value per validator.
#[derive(Clone, DataSize, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ValidatorMap<T>(Vec<T>);

impl<T> ValidatorMap<T> {
    /// Returns the number of values. This must equal the number of validators.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns an iterator over all values, in order of validator indexes.
    pub fn iter(&self) -> std::slice::Iter<T> {
        self.0.iter()
    }

    /// Returns an iterator over pairs of validator index and value.
    pub fn enumerate(&self) -> impl Iterator<Item = (ValidatorIndex, &T)> {
        self.iter()
            .enumerate()
            .map(|(idx, value)| (ValidatorIndex(idx as u32), value))
    }

    /// Returns the value for the given validator, if the index is in range.
    pub fn get(&self, idx: ValidatorIndex) -> Option<&T> {
        self.0.get(idx.0 as usize)
    }

    /// Returns the first index whose value is greater or equal to `probe`, or the map's length if
    /// there is none. The values must be sorted, e.g. cumulative weights.
    pub fn binary_search(&self, probe: &T) -> ValidatorIndex
    where
        T: Ord,
    {
        match self.0.binary_search(probe) {
            Ok(idx) | Err(idx) => ValidatorIndex(idx as u32),
        }
    }
}

impl<T> ValidatorMap<Option<T>> {
    /// Returns an iterator over the indexes whose value is `Some`.
    pub fn keys_some(&self) -> impl Iterator<Item = ValidatorIndex> + '_ {
        self.enumerate()
            .filter(|(_, opt)| opt.is_some())
            .map(|(idx, _)| idx)
    }

    /// Returns an iterator over all values that are present, with their indexes.
    pub fn iter_some(&self) -> impl Iterator<Item = (ValidatorIndex, &T)> {
        self.enumerate()
            .filter_map(|(idx, opt)| opt.as_ref().map(|value| (idx, value)))
    }
}

impl<T> From<Vec<T>> for ValidatorMap<T> {
    fn from(vec: Vec<T>) -> Self {
        ValidatorMap(vec)
    }
}

impl<T> AsRef<[T]> for ValidatorMap<T> {
    fn as_ref(&self) -> &[T] {
        &self.0
    }
}

impl<T> Index<ValidatorIndex> for ValidatorMap<T> {
    type Output = T;

    fn index(&self, idx: ValidatorIndex) -> &T {
        &self.0[idx.0 as usize]
    }
}

impl<T> IndexMut<ValidatorIndex> for ValidatorMap<T> {
    fn index_mut(&mut self, idx: ValidatorIndex) -> &mut T {
        &mut self.0[idx.0 as usize]
    }
}

impl<T> IntoIterator for ValidatorMap<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a ValidatorMap<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<T> FromIterator<T> for ValidatorMap<T> {
    fn from_iter<I: IntoIterator<Item = T>>(ii: I) -> ValidatorMap<T> {
        ValidatorMap(ii.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validators_sorted_by_id() {
        let validators: Validators<u32> = vec![(7u32, 10u64), (3, 5), (5, 8)]
            .into_iter()
            .collect();
        assert_eq!(3, validators.len());
        assert_eq!(Weight(23), validators.total_weight());
        // IDs are sorted, so 3 gets index 0.
        assert_eq!(Some(ValidatorIndex(0)), validators.get_index(&3));
        assert_eq!(Some(ValidatorIndex(2)), validators.get_index(&7));
        assert_eq!(&5, validators.get_by_index(ValidatorIndex(1)).id());
    }

    #[test]
    fn cumulative_weights_binary_search() {
        let validators: Validators<u32> = vec![(0u32, 3u64), (1, 4), (2, 5)].into_iter().collect();
        let cumulative = validators.cumulative_weights();
        assert_eq!(&[Weight(3), Weight(7), Weight(12)], cumulative.as_ref());
        assert_eq!(ValidatorIndex(0), cumulative.binary_search(&Weight(1)));
        assert_eq!(ValidatorIndex(0), cumulative.binary_search(&Weight(3)));
        assert_eq!(ValidatorIndex(1), cumulative.binary_search(&Weight(4)));
        assert_eq!(ValidatorIndex(2), cumulative.binary_search(&Weight(12)));
    }
}
