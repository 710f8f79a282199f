use std::marker::PhantomData;

/// Array-backed binary min-heap with a caller-supplied score function.
///
/// The element with the smallest score is popped first. No tie-break is
/// defined among equal scores: pop order within a score is unspecified.
pub struct BinaryHeap<T, K, F>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    content: Vec<T>,
    score: F,
    _key: PhantomData<fn() -> K>,
}

impl<T, K, F> BinaryHeap<T, K, F>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    pub fn new(score: F) -> Self {
        Self {
            content: Vec::new(),
            score,
            _key: PhantomData,
        }
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn peek(&self) -> Option<&T> {
        self.content.first()
    }

    /// Append then bubble up until the parent's score is no greater.
    pub fn push(&mut self, item: T) {
        self.content.push(item);
        self.bubble_up(self.content.len() - 1);
    }

    /// Remove and return the minimum-scored element.
    pub fn pop(&mut self) -> Option<T> {
        if self.content.is_empty() {
            return None;
        }
        let last = self.content.len() - 1;
        self.content.swap(0, last);
        let result = self.content.pop();
        if !self.content.is_empty() {
            self.sink_down(0);
        }
        result
    }

    /// Remove the first element equal to `item`, restoring heap order.
    pub fn remove(&mut self, item: &T)
    where
        T: PartialEq,
    {
        let Some(index) = self.content.iter().position(|e| e == item) else {
            return;
        };
        let last = self.content.len() - 1;
        self.content.swap(index, last);
        self.content.pop();
        if index < self.content.len() {
            self.bubble_up(index);
            self.sink_down(index);
        }
    }

    fn bubble_up(&mut self, mut n: usize) {
        while n > 0 {
            let parent = (n - 1) / 2;
            if (self.score)(&self.content[n]) >= (self.score)(&self.content[parent]) {
                break;
            }
            self.content.swap(n, parent);
            n = parent;
        }
    }

    fn sink_down(&mut self, mut n: usize) {
        let length = self.content.len();
        loop {
            let child1 = 2 * n + 1;
            let child2 = 2 * n + 2;
            let mut swap = None;

            if child1 < length
                && (self.score)(&self.content[child1]) < (self.score)(&self.content[n])
            {
                swap = Some(child1);
            }
            if child2 < length {
                let against = swap.unwrap_or(n);
                if (self.score)(&self.content[child2]) < (self.score)(&self.content[against]) {
                    swap = Some(child2);
                }
            }

            match swap {
                Some(target) => {
                    self.content.swap(n, target);
                    n = target;
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(n: &i32) -> i32 {
        *n
    }

    fn assert_heap_order(heap: &BinaryHeap<i32, i32, fn(&i32) -> i32>) {
        for i in 0..heap.content.len() {
            for child in [2 * i + 1, 2 * i + 2] {
                if child < heap.content.len() {
                    assert!(
                        heap.content[i] <= heap.content[child],
                        "heap order violated at index {i}"
                    );
                }
            }
        }
    }

    #[test]
    fn pop_returns_minimum() {
        let mut heap = BinaryHeap::new(identity as fn(&i32) -> i32);
        for n in [5, 3, 8, 1, 9, 2, 7] {
            heap.push(n);
            assert_heap_order(&heap);
        }
        let mut popped = Vec::new();
        while let Some(n) = heap.pop() {
            assert_heap_order(&heap);
            popped.push(n);
        }
        assert_eq!(popped, vec![1, 2, 3, 5, 7, 8, 9]);
    }

    #[test]
    fn pop_on_empty_returns_none() {
        let mut heap = BinaryHeap::new(identity as fn(&i32) -> i32);
        assert_eq!(heap.pop(), None);
        assert!(heap.is_empty());
    }

    #[test]
    fn interleaved_push_pop_keeps_minimum_property() {
        let mut heap = BinaryHeap::new(identity as fn(&i32) -> i32);
        let mut pseudo = 1u64;
        let mut reference: Vec<i32> = Vec::new();
        for _ in 0..500 {
            // xorshift, deterministic operation mix
            pseudo ^= pseudo << 13;
            pseudo ^= pseudo >> 7;
            pseudo ^= pseudo << 17;
            if pseudo % 3 == 0 && !reference.is_empty() {
                reference.sort_unstable();
                assert_eq!(heap.pop(), Some(reference.remove(0)));
            } else {
                let n = (pseudo % 1000) as i32;
                heap.push(n);
                reference.push(n);
            }
            assert_heap_order(&heap);
        }
    }

    #[test]
    fn remove_restores_heap_order() {
        let mut heap = BinaryHeap::new(identity as fn(&i32) -> i32);
        for n in [4, 1, 6, 3, 8] {
            heap.push(n);
        }
        heap.remove(&1);
        assert_heap_order(&heap);
        assert_eq!(heap.size(), 4);
        assert_eq!(heap.pop(), Some(3));

        // Removing an absent element is a no-op.
        heap.remove(&42);
        assert_eq!(heap.size(), 3);
    }

    #[test]
    fn string_scores_compare_lexicographically() {
        let mut heap = BinaryHeap::new(|s: &String| s.clone());
        for p in ["2", "00000", "10", "00001"] {
            heap.push(p.to_string());
        }
        assert_eq!(heap.pop().as_deref(), Some("00000"));
        assert_eq!(heap.pop().as_deref(), Some("00001"));
        assert_eq!(heap.pop().as_deref(), Some("10"));
        assert_eq!(heap.pop().as_deref(), Some("2"));
    }
}
