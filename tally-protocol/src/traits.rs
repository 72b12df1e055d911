use crate::value::Val;

/// A type-erased iterator over a collection of [`Getter`]s.
///
/// This type is usually returned from [`Getter::get_iter`] and allows paths to index into
/// collections, for example `items[0].price`.
///
/// # Example
///
/// ```
/// use tally_protocol::{Getter, GetterIter, Val};
///
/// struct Item {
///     price: u64,
/// }
///
/// impl Getter for Item {
///     fn get_value(&self, path: &str) -> Option<Val<'_>> {
///         match path {
///             "price" => Some(self.price.into()),
///             _ => None,
///         }
///     }
/// }
///
/// struct Cart {
///     items: Vec<Item>,
/// }
///
/// impl Getter for Cart {
///     fn get_value(&self, _path: &str) -> Option<Val<'_>> {
///         None
///     }
///
///     fn get_iter(&self, path: &str) -> Option<GetterIter<'_>> {
///         match path {
///             "items" => Some(GetterIter::new(self.items.iter())),
///             _ => None,
///         }
///     }
/// }
///
/// let cart = Cart {
///     items: vec![Item { price: 3 }, Item { price: 5 }],
/// };
///
/// let price = tally_protocol::resolve(&cart, "items[1].price").unwrap();
/// assert_eq!(price, Val::U64(5));
/// ```
pub struct GetterIter<'a> {
    iter: Box<dyn Iterator<Item = &'a dyn Getter> + 'a>,
}

impl<'a> GetterIter<'a> {
    /// Creates a new [`GetterIter`] given an iterator of a type that implements [`Getter`].
    pub fn new<I, T>(iterator: I) -> Self
    where
        I: Iterator<Item = &'a T> + 'a,
        T: Getter + 'a,
    {
        Self {
            iter: Box::new(iterator.map(|v| v as &dyn Getter)),
        }
    }
}

impl<'a> Iterator for GetterIter<'a> {
    type Item = &'a dyn Getter;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

/// A type that supports field access by paths.
///
/// This is the capability that metric rules use to read values and template placeholders out of
/// events. See [`resolve`](crate::resolve) for the full path syntax and the resolution order.
///
/// # Implementation
///
///  1. Fields are referenced by the name of the field in the containing structure. Implementors
///     may answer dotted paths such as `user.id` directly from `get_value`.
///  2. Nested structures can instead be exposed through [`get_child`](Self::get_child), in which
///     case the remainder of the path is resolved against the child.
///  3. Collections are exposed through [`get_iter`](Self::get_iter) and indexed numerically.
///  4. Accessor-style names do not need to be listed separately: a lookup for `getValue` or
///     `get_value` also tries `value`, and a lookup for `route` also tries `getRoute`.
///
/// # Example
///
/// ```
/// use tally_protocol::{Getter, Val};
///
/// struct Root {
///     a: u64,
///     b: Nested,
/// }
///
/// struct Nested {
///     c: u64,
/// }
///
/// impl Getter for Root {
///     fn get_value(&self, path: &str) -> Option<Val<'_>> {
///         match path {
///             "a" => Some(self.a.into()),
///             "b.c" => Some(self.b.c.into()),
///             _ => None,
///         }
///     }
/// }
///
/// let root = Root {
///   a: 1,
///   b: Nested {
///     c: 2,
///   }
/// };
///
/// assert_eq!(root.get_value("a"), Some(Val::U64(1)));
/// assert_eq!(root.get_value("b.c"), Some(Val::U64(2)));
/// assert_eq!(root.get_value("d"), None);
/// ```
pub trait Getter {
    /// Returns the value of a field pointed to by a `path`.
    fn get_value(&self, path: &str) -> Option<Val<'_>>;

    /// Returns a nested structure by its field name.
    ///
    /// If the field does not exist or is a scalar, this returns `None`.
    fn get_child(&self, _name: &str) -> Option<&dyn Getter> {
        None
    }

    /// Returns an iterator over the collection pointed to by a `path`.
    ///
    /// If the path does not exist or is not a collection, this returns `None`. Note that
    /// `get_value` may not return a value for paths that expose an iterator.
    fn get_iter(&self, _path: &str) -> Option<GetterIter<'_>> {
        None
    }
}

/// A named event dispatched by the host application.
///
/// The name selects the metric rules that apply to the event; the [`Getter`] supertrait gives the
/// rules access to the event's data.
pub trait Event: Getter {
    /// Returns the name under which rules for this event are registered.
    fn name(&self) -> &str;

    /// Returns the name of the concrete event type, used in error messages.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
