use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use ordered_float::OrderedFloat;
use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator};
use tracing::{debug, trace};

use crate::{CoverTreeError, Distance, Scalar};

/// Query result containing k-nearest neighbours to a query point.
#[derive(Debug)]
pub struct QueryResult<P> {
    query_index: usize,
    neighbours: VecDeque<Neighbour<P>>,
}

impl<P> QueryResult<P> {
    pub(crate) fn new(query_index: usize, neighbours: VecDeque<Neighbour<P>>) -> Self {
        Self {
            query_index,
            neighbours,
        }
    }

    /// Returns the query index from batch query for this result.
    pub fn index(&self) -> usize {
        self.query_index
    }

    /// Returns the nearest neighbours of a query, ascending by distance.
    pub fn neighbours(&self) -> &VecDeque<Neighbour<P>> {
        &self.neighbours
    }

    /// Consumes ```self``` and returns the query index and the nearest neighbours of that query.
    pub fn take(self) -> (usize, VecDeque<Neighbour<P>>) {
        (self.query_index, self.neighbours)
    }
}

/// A neighbour resulted from a k-nearest neighbour search.
#[derive(Debug, Clone)]
pub struct Neighbour<P> {
    dist: Scalar,
    point: P,
}

impl<P> Neighbour<P> {
    /// Returns the distance for a neighbour to a query point.
    pub fn dist(&self) -> Scalar {
        self.dist
    }

    /// Returns the point of a neighbour.
    pub fn point(&self) -> &P {
        &self.point
    }

    /// Consumes ```self``` and returns the owned point.
    pub fn into_point(self) -> P {
        self.point
    }
}

type Link<P> = Arc<RwLock<Node<P>>>;

/// A tree vertex: the payload point, one ordered child list per level
/// with descendants, and a non-owning reference back to the parent.
pub(crate) struct Node<P> {
    data: P,
    children: BTreeMap<i32, Vec<Link<P>>>,
    parent: Option<Weak<RwLock<Node<P>>>>,
}

impl<P> Node<P> {
    pub(crate) fn new(data: P) -> Self {
        Self {
            data,
            children: BTreeMap::new(),
            parent: None,
        }
    }

    /// Attaches ```child``` under ```parent``` at ```level``` and points the child
    /// back at its parent. Re-attaching the same node at the same level
    /// is a no-op.
    pub(crate) fn add_child(parent: &Link<P>, child: Link<P>, level: i32) {
        let mut pw = parent.write().unwrap();
        let slot = pw.children.entry(level).or_insert_with(Vec::new);
        if slot.iter().any(|q| Arc::ptr_eq(q, &child)) {
            return;
        }

        child.write().unwrap().parent = Some(Arc::downgrade(parent));
        slot.push(child);
    }

    /// Children recorded at ```level```; empty if none were ever attached there.
    pub(crate) fn children_at(&self, level: i32) -> Vec<Link<P>> {
        self.children.get(&level).cloned().unwrap_or_default()
    }

    /// The nodes present at ```level``` under this node: the node itself
    /// first, then the children attached at ```level```. A node present at
    /// some level is present at every finer level as well, which is why
    /// it always lists itself.
    #[allow(dead_code)]
    pub(crate) fn children_with_self(this: &Link<P>, level: i32) -> Vec<Link<P>> {
        let mut nodes = vec![Arc::clone(this)];
        nodes.extend(this.read().unwrap().children_at(level));
        nodes
    }

    /// Detaches this node from the child list its parent keeps at
    /// ```level + 1``` and clears the back-reference. Structural primitive
    /// for deletion support; no traversal calls it yet.
    #[allow(dead_code)]
    pub(crate) fn detach(this: &Link<P>, level: i32) {
        let parent = this.write().unwrap().parent.take();
        if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
            let mut pw = parent.write().unwrap();
            if let Some(slot) = pw.children.get_mut(&(level + 1)) {
                slot.retain(|q| !Arc::ptr_eq(q, this));
            }
        }
    }

    /// Number of descendants below this node.
    pub(crate) fn count(&self) -> usize {
        self.children
            .values()
            .map(|level| {
                level.len()
                    + level
                        .iter()
                        .map(|q| q.read().unwrap().count())
                        .sum::<usize>()
            })
            .sum()
    }

    /// Walks the subtree and asserts the covering invariant: a child
    /// attached at ```level``` lies within ```base^(level + 1)``` of its parent.
    #[allow(dead_code)]
    pub(crate) fn verify<D: Distance<P>>(&self, distance: &D, base: Scalar) {
        for (&level, nodes) in &self.children {
            for child in nodes {
                let cr = child.read().unwrap();
                let d = distance.distance(&self.data, &cr.data);
                assert!(d <= base.powi(level + 1));
                cr.verify(distance, base);
            }
        }
    }
}

/// A hierarchical index over a metric space for fast nearest neighbour
/// search, requiring ```O(n)``` space. Levels are explicit signed integers:
/// level ```i``` stands for the characteristic distance ```base^i```, the root
/// sits at the coarsest level and every descent walks level by level
/// towards the finest populated one.
pub struct CoverTree<P, D> {
    distance: D,
    root: Option<Link<P>>,
    maxlevel: i32,
    minlevel: i32,
    base: Scalar,
    rng: oorandom::Rand64,
}

impl<P, D> fmt::Debug for CoverTree<P, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoverTree")
            .field("maxlevel", &self.maxlevel)
            .field("minlevel", &self.minlevel)
            .field("base", &self.base)
            .field("size", &self.size())
            .finish()
    }
}

impl<P, D> CoverTree<P, D> {
    /// Returns the number of points in a tree.
    pub fn size(&self) -> usize {
        match &self.root {
            Some(root) => root.read().unwrap().count() + 1,
            None => 0,
        }
    }

    /// Returns ```true``` if the tree holds no points.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Coarsest level of the hierarchy, fixed at construction.
    pub fn maxlevel(&self) -> i32 {
        self.maxlevel
    }

    /// Finest level populated so far. Starts at ```maxlevel``` and only
    /// decreases, each time a point is attached below it.
    pub fn minlevel(&self) -> i32 {
        self.minlevel
    }

    /// Scale factor between adjacent levels.
    pub fn base(&self) -> Scalar {
        self.base
    }

    /// Characteristic cover radius of ```level```.
    #[inline(always)]
    fn covdist(&self, level: i32) -> Scalar {
        self.base.powi(level)
    }
}

impl<P, D> CoverTree<P, D>
where
    P: Clone,
    D: Distance<P>,
{
    /// Creates an empty tree around ```distance``` with the default level
    /// range and base.
    pub fn new(distance: D) -> Self {
        CoverTreeBuilder::new(distance).build()
    }

    /// Inserts a new point into the tree. Inserting a point that is
    /// already present (zero distance to an existing node) is a no-op.
    ///
    /// Fails with [`CoverTreeError::InvalidLevelRange`] when the point
    /// is too far from the root to be covered at the coarsest level.
    pub fn insert(&mut self, p: P) -> Result<(), CoverTreeError> {
        match self.root.clone() {
            Some(root) => self.insert_iter(p, root),
            None => {
                self.root = Some(Arc::new(RwLock::new(Node::new(p))));
                Ok(())
            }
        }
    }

    fn insert_iter(&mut self, p: P, root: Link<P>) -> Result<(), CoverTreeError> {
        let d_root = self.distance.distance(&p, &root.read().unwrap().data);
        let mut cover = vec![root];
        let mut dists = vec![d_root];
        let mut level = self.maxlevel;

        loop {
            let (q, q_dists) = self.expand_cover_set(&p, &cover, &dists, level);
            let d_min = min_dist(&q_dists);

            if d_min == 0.0 {
                trace!("point already present at level {}, skipping insert", level);
                return Ok(());
            }

            if d_min > self.covdist(level) {
                // Nothing covers the point at this scale anymore, so it
                // belongs here, under a candidate from one level up.
                let parent = self.pick_parent(&cover, &dists, level)?;
                Node::add_child(&parent, Arc::new(RwLock::new(Node::new(p))), level);
                self.minlevel = self.minlevel.min(level);
                debug!("attached point at level {}", level);
                return Ok(());
            }

            let radius = self.covdist(level);
            let (cover_next, dists_next) = prune(q, q_dists, radius);
            cover = cover_next;
            dists = dists_next;
            level -= 1;
        }
    }

    /// Returns the ```k``` points closest to ```p```, ascending by distance.
    pub fn knn(&self, p: &P, k: usize) -> Result<QueryResult<P>, CoverTreeError> {
        let root = self.root.as_ref().ok_or(CoverTreeError::EmptyTree)?;
        Ok(QueryResult::new(0, self.knn_iter(p, k, Arc::clone(root))))
    }

    /// Searches the ```k``` nearest neighbours for every point in
    /// ```queries```, fanning the read-only descents out over the rayon
    /// thread pool. Each result carries the index of its query.
    pub fn knn_batch(&self, queries: &[P], k: usize) -> Result<Vec<QueryResult<P>>, CoverTreeError>
    where
        P: Send + Sync,
        D: Sync,
    {
        let root = self.root.as_ref().ok_or(CoverTreeError::EmptyTree)?;
        Ok(queries
            .par_iter()
            .enumerate()
            .map(|(index, p)| QueryResult::new(index, self.knn_iter(p, k, Arc::clone(root))))
            .collect())
    }

    fn knn_iter(&self, p: &P, k: usize, root: Link<P>) -> VecDeque<Neighbour<P>> {
        let d_root = self.distance.distance(p, &root.read().unwrap().data);
        let mut cover = vec![root];
        let mut dists = vec![d_root];

        for level in (self.minlevel..=self.maxlevel).rev() {
            let (q, q_dists) = self.expand_cover_set(p, &cover, &dists, level);
            let d_k = kth_smallest(&q_dists, k.max(1));
            // A candidate kept here may still hide descendants below this
            // level, up to base^(level + 1) away from it.
            let threshold = d_k + self.covdist(level + 1);
            let (cover_next, dists_next) = prune(q, q_dists, threshold);
            cover = cover_next;
            dists = dists_next;
        }

        args_min(&cover, &dists, k)
    }

    /// Runs a single descent that returns the ```k``` nearest neighbours of
    /// ```p``` and inserts ```p```, amortising the cost of two tree walks. The
    /// neighbour result never contains the point just inserted; if the
    /// point is already present, only the query half takes effect.
    pub fn knn_insert(&mut self, p: P, k: usize) -> Result<QueryResult<P>, CoverTreeError> {
        let root = match &self.root {
            Some(root) => Arc::clone(root),
            None => return Err(CoverTreeError::EmptyTree),
        };

        let d_root = self.distance.distance(&p, &root.read().unwrap().data);
        let mut cover = vec![root];
        let mut dists = vec![d_root];
        let mut level = self.maxlevel;
        let mut attach: Option<(Link<P>, i32)> = None;
        let mut duplicate = false;

        while (attach.is_none() && !duplicate) || level >= self.minlevel {
            let (q, q_dists) = self.expand_cover_set(&p, &cover, &dists, level);
            let d_min = min_dist(&q_dists);
            let d_k = kth_smallest(&q_dists, k.max(1));

            if d_min == 0.0 && !duplicate {
                // The point is already in the tree: keep descending for
                // the neighbour result, but attach nothing.
                trace!("point already present at level {}, query only", level);
                duplicate = true;
                attach = None;
            }

            if !duplicate && attach.is_none() && d_min > self.covdist(level) {
                let parent = self.pick_parent(&cover, &dists, level)?;
                attach = Some((parent, level));
            }

            let threshold = d_k + self.covdist(level + 1);
            let (cover_next, dists_next) = prune(q, q_dists, threshold);
            cover = cover_next;
            dists = dists_next;
            level -= 1;
        }

        if let Some((parent, attach_level)) = attach {
            Node::add_child(&parent, Arc::new(RwLock::new(Node::new(p))), attach_level);
            self.minlevel = self.minlevel.min(attach_level);
            debug!("attached point at level {} after query", attach_level);
        }

        Ok(QueryResult::new(0, args_min(&cover, &dists, k)))
    }

    /// Reports the level at which ```p``` is stored, or ```None``` when no node
    /// of the tree is at distance zero from ```p```.
    pub fn find(&self, p: &P) -> Result<Option<i32>, CoverTreeError> {
        let root = self.root.as_ref().ok_or(CoverTreeError::EmptyTree)?;
        let d_root = self.distance.distance(p, &root.read().unwrap().data);
        Ok(self.find_rec(p, vec![Arc::clone(root)], vec![d_root], self.maxlevel))
    }

    fn find_rec(&self, p: &P, cover: Vec<Link<P>>, dists: Vec<Scalar>, level: i32) -> Option<i32> {
        if level < self.minlevel || cover.is_empty() {
            return None;
        }

        let (q, q_dists) = self.expand_cover_set(p, &cover, &dists, level);
        if q_dists.iter().any(|&d| d == 0.0) {
            return Some(level);
        }

        let (cover_next, dists_next) = prune(q, q_dists, self.covdist(level));
        self.find_rec(p, cover_next, dists_next, level - 1)
    }

    /// Expands the cover set with the children its members keep at
    /// ```level``` and computes the distances of the newcomers to ```p```. The
    /// incoming candidates are never discarded here: a node present at a
    /// coarse level stays reachable at every finer one.
    fn expand_cover_set(
        &self,
        p: &P,
        cover: &[Link<P>],
        dists: &[Scalar],
        level: i32,
    ) -> (Vec<Link<P>>, Vec<Scalar>) {
        let mut q = cover.to_vec();
        let mut q_dists = dists.to_vec();

        for node in cover {
            let children = node.read().unwrap().children_at(level);
            for child in children {
                let d = self.distance.distance(p, &child.read().unwrap().data);
                q.push(child);
                q_dists.push(d);
            }
        }

        (q, q_dists)
    }

    /// Chooses uniformly at random among the pre-expansion candidates
    /// close enough to cover a point attached at ```level```.
    fn pick_parent(
        &mut self,
        cover: &[Link<P>],
        dists: &[Scalar],
        level: i32,
    ) -> Result<Link<P>, CoverTreeError> {
        let radius = self.covdist(level + 1);
        let candidates: Vec<&Link<P>> = cover
            .iter()
            .zip(dists.iter())
            .filter(|&(_, &d)| d <= radius)
            .map(|(q, _)| q)
            .collect();

        if candidates.is_empty() {
            // Only possible at the coarsest level: deeper cover sets were
            // already pruned to this radius before expansion.
            return Err(CoverTreeError::InvalidLevelRange {
                distance: min_dist(dists),
                radius,
            });
        }

        let pick = self.rng.rand_range(0..candidates.len() as u64) as usize;
        Ok(Arc::clone(candidates[pick]))
    }

    #[allow(dead_code)]
    pub(crate) fn verify(&self) {
        if let Some(root) = &self.root {
            root.read().unwrap().verify(&self.distance, self.base);
        }
    }
}

fn min_dist(dists: &[Scalar]) -> Scalar {
    dists.iter().cloned().fold(Scalar::INFINITY, Scalar::min)
}

/// Distance of the k-th closest candidate, or of the farthest one when
/// fewer than ```k``` are known.
fn kth_smallest(dists: &[Scalar], k: usize) -> Scalar {
    if dists.is_empty() {
        return Scalar::INFINITY;
    }

    let mut keys: Vec<OrderedFloat<Scalar>> = dists.iter().map(|&d| OrderedFloat(d)).collect();
    let idx = k.min(keys.len()) - 1;
    let (_, kth, _) = keys.select_nth_unstable(idx);
    kth.0
}

fn prune<P>(
    q: Vec<Link<P>>,
    q_dists: Vec<Scalar>,
    threshold: Scalar,
) -> (Vec<Link<P>>, Vec<Scalar>) {
    let mut cover = Vec::with_capacity(q.len());
    let mut dists = Vec::with_capacity(q.len());

    for (node, d) in q.into_iter().zip(q_dists) {
        if d <= threshold {
            cover.push(node);
            dists.push(d);
        }
    }

    (cover, dists)
}

/// The ```k``` closest candidates as owned neighbours, ascending by
/// distance. Equal distances keep their discovery order: candidates
/// from coarser levels come first.
fn args_min<P: Clone>(cover: &[Link<P>], dists: &[Scalar], k: usize) -> VecDeque<Neighbour<P>> {
    let mut order: Vec<usize> = (0..cover.len()).collect();
    order.sort_by_key(|&i| OrderedFloat(dists[i]));

    order
        .into_iter()
        .take(k)
        .map(|i| Neighbour {
            dist: dists[i],
            point: cover[i].read().unwrap().data.clone(),
        })
        .collect()
}

/// A build struct for initialising a new cover tree.
pub struct CoverTreeBuilder<P, D> {
    distance: D,
    root: Option<P>,
    maxlevel: i32,
    base: Scalar,
    seed: u128,
}

impl<P, D> fmt::Debug for CoverTreeBuilder<P, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoverTreeBuilder")
            .field("maxlevel", &self.maxlevel)
            .field("base", &self.base)
            .field("seed", &self.seed)
            .finish()
    }
}

impl<P, D> CoverTreeBuilder<P, D>
where
    P: Clone,
    D: Distance<P>,
{
    /// Creates a builder around the distance function with default
    /// parameters: ```maxlevel = 10```, ```base = 2```.
    pub fn new(distance: D) -> Self {
        Self {
            distance,
            root: None,
            maxlevel: 10,
            base: 2.,
            seed: 0,
        }
    }

    /// Sets the initial root point.
    pub fn root(mut self, root: P) -> Self {
        self.root = Some(root);
        self
    }

    /// Sets the coarsest level of the tree. ```base^maxlevel``` should
    /// dominate the diameter of the data.
    pub fn maxlevel(mut self, maxlevel: i32) -> Self {
        self.maxlevel = maxlevel;
        self
    }

    /// Sets the ```base``` in exponentiation when calculating the covering
    /// distance of a level.
    pub fn base(mut self, base: Scalar) -> Self {
        self.base = base;
        self
    }

    /// Seeds the random source behind parent selection, making the tree
    /// shape reproducible for a fixed insertion order.
    pub fn seed(mut self, seed: u128) -> Self {
        self.seed = seed;
        self
    }

    /// Constructs a cover tree based on the given parameters.
    pub fn build(self) -> CoverTree<P, D> {
        let maxlevel = self.maxlevel;
        CoverTree {
            distance: self.distance,
            root: self.root.map(|p| Arc::new(RwLock::new(Node::new(p)))),
            maxlevel,
            minlevel: maxlevel,
            base: self.base,
            rng: oorandom::Rand64::new(self.seed),
        }
    }

    /// Constructs a cover tree and inserts every point of ```points``` in
    /// order. The first point becomes the root unless one was set.
    pub fn build_from<I>(self, points: I) -> Result<CoverTree<P, D>, CoverTreeError>
    where
        I: IntoIterator<Item = P>,
    {
        let mut tree = self.build();
        for p in points {
            tree.insert(p)?;
        }

        Ok(tree)
    }
}
