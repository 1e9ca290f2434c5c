use core::time::Duration;

const DEFAULT_HASHPOWER: u32 = 13;
const DEFAULT_MAX_HASHPOWER: u32 = 32;
const DEFAULT_NUM_THREADS: usize = 4;
const DEFAULT_BAG_CAPACITY: usize = 64;
const DEFAULT_MAINTENANCE_SLEEP: Duration = Duration::from_millis(10);

////////////////////////////////////////////////////////////////////////////////////////////////////
// Config
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A type containing the configuration parameters for an index.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    hashpower: u32,
    max_hashpower: u32,
    num_threads: usize,
    bag_capacity: usize,
    maintenance_sleep: Duration,
}

/***** impl Default *******************************************************************************/

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/***** impl inherent ******************************************************************************/

impl Config {
    /// Creates a new default [`Config`].
    #[inline]
    pub const fn new() -> Self {
        Self {
            hashpower: DEFAULT_HASHPOWER,
            max_hashpower: DEFAULT_MAX_HASHPOWER,
            num_threads: DEFAULT_NUM_THREADS,
            bag_capacity: DEFAULT_BAG_CAPACITY,
            maintenance_sleep: DEFAULT_MAINTENANCE_SLEEP,
        }
    }

    /// Creates a new [`Config`] with the given parameters; a `hashpower` of
    /// zero selects the default.
    #[inline]
    pub fn with_params(hashpower: u32, num_threads: usize) -> Self {
        ConfigBuilder::new().hashpower(hashpower).num_threads(num_threads).build()
    }

    /// Returns a new [`ConfigBuilder`].
    #[inline]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Returns the initial hash power (buckets are `2^hashpower`).
    #[inline]
    pub fn hashpower(&self) -> u32 {
        self.hashpower
    }

    /// Returns the hash power beyond which the table stops expanding.
    #[inline]
    pub fn max_hashpower(&self) -> u32 {
        self.max_hashpower
    }

    /// Returns the number of worker threads the index is sized for.
    #[inline]
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Returns the initial capacity of each limbo bag.
    #[inline]
    pub fn bag_capacity(&self) -> usize {
        self.bag_capacity
    }

    /// Returns how long the maintenance thread sleeps between epoch polls.
    #[inline]
    pub fn maintenance_sleep(&self) -> Duration {
        self.maintenance_sleep
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ConfigBuilder
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A builder type for [`Config`] instances.
#[derive(Copy, Clone, Debug, Default)]
pub struct ConfigBuilder {
    hashpower: Option<u32>,
    max_hashpower: Option<u32>,
    num_threads: Option<usize>,
    bag_capacity: Option<usize>,
    maintenance_sleep: Option<Duration>,
}

impl ConfigBuilder {
    /// Creates a new [`ConfigBuilder`].
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial hash power; zero selects the default.
    #[inline]
    pub fn hashpower(mut self, hashpower: u32) -> Self {
        self.hashpower = if hashpower == 0 { None } else { Some(hashpower) };
        self
    }

    /// Sets the hash power beyond which the table stops expanding.
    #[inline]
    pub fn max_hashpower(mut self, max_hashpower: u32) -> Self {
        self.max_hashpower = Some(max_hashpower);
        self
    }

    /// Sets the number of worker threads.
    #[inline]
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Sets the initial capacity of each limbo bag.
    #[inline]
    pub fn bag_capacity(mut self, bag_capacity: usize) -> Self {
        self.bag_capacity = Some(bag_capacity);
        self
    }

    /// Sets the maintenance thread's epoch-poll interval.
    #[inline]
    pub fn maintenance_sleep(mut self, maintenance_sleep: Duration) -> Self {
        self.maintenance_sleep = Some(maintenance_sleep);
        self
    }

    /// Consumes the builder and creates a new [`Config`] instance with the
    /// configured parameters or their default values, if they were not set.
    ///
    /// # Panics
    ///
    /// Panics if the number of threads is zero or the initial hash power
    /// exceeds the maximum.
    #[inline]
    pub fn build(self) -> Config {
        let config = Config {
            hashpower: self.hashpower.unwrap_or(DEFAULT_HASHPOWER),
            max_hashpower: self.max_hashpower.unwrap_or(DEFAULT_MAX_HASHPOWER),
            num_threads: self.num_threads.unwrap_or(DEFAULT_NUM_THREADS),
            bag_capacity: self.bag_capacity.unwrap_or(DEFAULT_BAG_CAPACITY),
            maintenance_sleep: self.maintenance_sleep.unwrap_or(DEFAULT_MAINTENANCE_SLEEP),
        };

        assert!(config.num_threads > 0, "the index requires at least one worker thread");
        assert!(
            config.hashpower <= config.max_hashpower,
            "the initial hash power must not exceed the maximum"
        );

        config
    }
}
