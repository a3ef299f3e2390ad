use kube::ResourceExt;
use kubert::index::NamespacedRemoved;
use parking_lot::RwLock;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;

/// Wraps a shared index, recording the updates applied to it.
pub struct IndexMetrics<T> {
    inner: T,

    size: Family<NamespacedLabels, Gauge>,
    applies: Family<NamespacedLabels, Counter>,
    deletes: Family<NamespacedLabels, Counter>,
    resets: Family<KindLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct NamespacedLabels {
    namespace: String,
    kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

/// Reports the number of resources of kind `R` held for a namespace.
pub trait SizedIndex<R> {
    fn size(&self, namespace: &str) -> usize;
}

impl<T, R> SizedIndex<R> for Arc<RwLock<T>>
where
    T: SizedIndex<R>,
{
    fn size(&self, namespace: &str) -> usize {
        self.read().size(namespace)
    }
}

// === impl IndexMetrics ===

impl<T> IndexMetrics<T> {
    pub fn register(inner: T, prom: &mut Registry) -> Self {
        let size = Family::default();
        prom.register(
            "index_size",
            "The number of resources held in the index",
            size.clone(),
        );

        let applies = Family::default();
        prom.register(
            "index_applies",
            "Count of resources applied to the index",
            applies.clone(),
        );

        let deletes = Family::default();
        prom.register(
            "index_deletes",
            "Count of resources deleted from the index",
            deletes.clone(),
        );

        let resets = Family::default();
        prom.register(
            "index_resets",
            "Count of index resets after a watch restarted",
            resets.clone(),
        );

        Self {
            inner,
            size,
            applies,
            deletes,
            resets,
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }

    fn labels<R: ResourceExt<DynamicType = ()>>(namespace: String) -> NamespacedLabels {
        NamespacedLabels {
            namespace,
            kind: R::kind(&()).to_string(),
        }
    }
}

impl<T, R> kubert::index::IndexNamespacedResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex<R> + kubert::index::IndexNamespacedResource<R>,
    R: ResourceExt<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        let namespace = resource.namespace().unwrap_or_default();
        self.applies
            .get_or_create(&Self::labels::<R>(namespace.clone()))
            .inc();
        self.inner.write().apply(resource);
        self.record_size::<R>(namespace);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.deletes
            .get_or_create(&Self::labels::<R>(namespace.clone()))
            .inc();
        self.inner.write().delete(namespace.clone(), name);
        self.record_size::<R>(namespace);
    }

    fn reset(&mut self, resources: Vec<R>, removed: NamespacedRemoved) {
        let mut namespaces = resources
            .iter()
            .filter_map(|r| r.namespace())
            .chain(removed.keys().cloned())
            .collect::<Vec<_>>();
        namespaces.sort();
        namespaces.dedup();

        self.resets
            .get_or_create(&KindLabels {
                kind: R::kind(&()).to_string(),
            })
            .inc();
        self.inner.write().reset(resources, removed);
        for namespace in namespaces {
            self.record_size::<R>(namespace);
        }
    }
}

impl<T> IndexMetrics<Arc<RwLock<T>>> {
    fn record_size<R>(&self, namespace: String)
    where
        T: SizedIndex<R>,
        R: ResourceExt<DynamicType = ()>,
    {
        let size = SizedIndex::<R>::size(&self.inner, &namespace);
        self.size
            .get_or_create(&Self::labels::<R>(namespace))
            .set(size as i64);
    }
}
