/// Generates a chained setter and a getter for each flag of an options struct that keeps its
/// switches in a `BitFlags` field.
macro_rules! flag_options {
    ($ty:ident . $field:ident : $flag:ident {
        $($(#[$attr:meta])* $set:ident, $get:ident => $e:ident,)*
    }) => {
        impl $ty {
            $(
                $(#[$attr])*
                pub fn $set(mut self, v: bool) -> Self {
                    if v {
                        self.$field.insert($flag::$e);
                    } else {
                        self.$field.remove($flag::$e);
                    }
                    self
                }

                $(#[$attr])*
                pub fn $get(&self) -> bool {
                    self.$field.contains($flag::$e)
                }
            )*
        }
    };
}
