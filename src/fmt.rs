#![macro_use]
#![allow(unused_macros)]

// Logging shims. With the `defmt` feature they forward to defmt, otherwise the
// arguments are only borrowed so call sites stay warning free.

macro_rules! trace {
  ($s:literal $(, $x:expr)* $(,)?) => {
    {
      #[cfg(feature = "defmt")]
      ::defmt::trace!($s $(, $x)*);
      #[cfg(not(feature = "defmt"))]
      let _ = ($( & $x ),*);
    }
  };
}

macro_rules! debug {
  ($s:literal $(, $x:expr)* $(,)?) => {
    {
      #[cfg(feature = "defmt")]
      ::defmt::debug!($s $(, $x)*);
      #[cfg(not(feature = "defmt"))]
      let _ = ($( & $x ),*);
    }
  };
}

macro_rules! info {
  ($s:literal $(, $x:expr)* $(,)?) => {
    {
      #[cfg(feature = "defmt")]
      ::defmt::info!($s $(, $x)*);
      #[cfg(not(feature = "defmt"))]
      let _ = ($( & $x ),*);
    }
  };
}

macro_rules! warn {
  ($s:literal $(, $x:expr)* $(,)?) => {
    {
      #[cfg(feature = "defmt")]
      ::defmt::warn!($s $(, $x)*);
      #[cfg(not(feature = "defmt"))]
      let _ = ($( & $x ),*);
    }
  };
}

macro_rules! error {
  ($s:literal $(, $x:expr)* $(,)?) => {
    {
      #[cfg(feature = "defmt")]
      ::defmt::error!($s $(, $x)*);
      #[cfg(not(feature = "defmt"))]
      let _ = ($( & $x ),*);
    }
  };
}
