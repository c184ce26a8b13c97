//! Pagination and sorting primitives shared by list, history and report queries.

use core::cmp::Ordering;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use stockshift_core::{DomainError, DomainResult};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 1000;

/// A zero-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    page: u32,
    size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 0,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// Build a request; `size` is capped at [`MAX_PAGE_SIZE`].
    pub fn new(page: u32, size: u32) -> DomainResult<Self> {
        PageLimits::default().request(Some(page), Some(size))
    }

    pub fn first(size: u32) -> DomainResult<Self> {
        Self::new(0, size)
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.size)
    }

    pub fn limit(&self) -> u64 {
        u64::from(self.size)
    }
}

/// Deployment-level page size policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLimits {
    pub default_size: u32,
    pub max_size: u32,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_size: DEFAULT_PAGE_SIZE,
            max_size: MAX_PAGE_SIZE,
        }
    }
}

impl PageLimits {
    /// Resolve optional caller input into a page request.
    pub fn request(&self, page: Option<u32>, size: Option<u32>) -> DomainResult<PageRequest> {
        let size = size.unwrap_or(self.default_size);
        if size == 0 {
            return Err(DomainError::validation("invalid-page-size"));
        }
        Ok(PageRequest {
            page: page.unwrap_or(0),
            size: size.min(self.max_size.max(1)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn is_ascending(&self) -> bool {
        matches!(self, SortDirection::Asc)
    }

    /// Orient an ascending comparison result.
    pub fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

impl FromStr for SortDirection {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            _ => Err(DomainError::validation("invalid-sort")),
        }
    }
}

/// A sortable property of some query, with its default ordering.
pub trait SortField: Copy + FromStr<Err = DomainError> {
    fn default_sort() -> Sort<Self>;
}

/// Sort specification (`field,direction`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sort<F> {
    pub field: F,
    pub direction: SortDirection,
}

impl<F: SortField> Sort<F> {
    pub fn new(field: F, direction: SortDirection) -> Self {
        Self { field, direction }
    }

    pub fn asc(field: F) -> Self {
        Self::new(field, SortDirection::Asc)
    }

    pub fn desc(field: F) -> Self {
        Self::new(field, SortDirection::Desc)
    }

    /// Parse `"field"` or `"field,asc|desc"`.
    ///
    /// A missing or blank value yields the field's default sort. A field given
    /// without direction sorts ascending.
    pub fn parse(raw: Option<&str>) -> DomainResult<Self> {
        let raw = match raw.map(str::trim) {
            None | Some("") => return Ok(F::default_sort()),
            Some(raw) => raw,
        };

        let (field, direction) = match raw.split_once(',') {
            Some((field, direction)) => (field, direction.parse()?),
            None => (raw, SortDirection::Asc),
        };
        Ok(Self::new(field.parse()?, direction))
    }
}

impl<F: SortField> Default for Sort<F> {
    fn default() -> Self {
        F::default_sort()
    }
}

/// Declare a sort field enum with its wire names and default ordering.
macro_rules! sort_fields {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $wire:literal),+ $(,)? }
        default $default:ident $direction:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl core::str::FromStr for $name {
            type Err = stockshift_core::DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($wire => Ok($name::$variant),)+
                    _ => Err(stockshift_core::DomainError::validation("invalid-sort")),
                }
            }
        }

        impl $crate::paging::SortField for $name {
            fn default_sort() -> $crate::paging::Sort<Self> {
                $crate::paging::Sort::new(
                    $name::$default,
                    $crate::paging::SortDirection::$direction,
                )
            }
        }
    };
}

pub(crate) use sort_fields;

/// One page of results plus totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total_elements: u64,
    pub total_pages: u64,
}

impl<T> Page<T> {
    pub fn new(content: Vec<T>, request: PageRequest, total_elements: u64) -> Self {
        let size = u64::from(request.size());
        Self {
            content,
            page: request.page(),
            size: request.size(),
            total_elements,
            total_pages: total_elements.div_ceil(size),
        }
    }

    /// Cut one page out of an already sorted, fully materialized result.
    pub fn from_sorted(items: Vec<T>, request: PageRequest) -> Self {
        let total = items.len() as u64;
        let offset = usize::try_from(request.offset()).unwrap_or(usize::MAX);
        let content = items
            .into_iter()
            .skip(offset)
            .take(request.size() as usize)
            .collect();
        Self::new(content, request, total)
    }

    pub fn empty(request: PageRequest) -> Self {
        Self::new(Vec::new(), request, 0)
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            page: self.page,
            size: self.size,
            total_elements: self.total_elements,
            total_pages: self.total_pages,
        }
    }

    pub fn is_last(&self) -> bool {
        u64::from(self.page) + 1 >= self.total_pages
    }
}
